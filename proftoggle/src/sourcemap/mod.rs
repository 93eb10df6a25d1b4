//! # Source Map Translation
//!
//! Profiles of generated code (bundled JavaScript, transpiled output, code
//! produced by build scripts) point at files nobody edits. When the
//! generator also wrote a v3 source map next to its output, the frames can be
//! pointed back at the original sources before the profile is written.
//!
//! ## Flow
//!
//! ```text
//! 1. install() reads PROFTOGGLE_SOURCEMAP_DIRS / _PACKAGES
//! 2. SourcemapIndex::build walks them for *.map files
//!    bundle.js.map  ->  /srv/app/dist/bundle.js  (generated file)
//! 3. On stop, rewrite_profile() looks up every frame's (file, line)
//!    /srv/app/dist/bundle.js:2  ->  /srv/app/src/app.ts:3  run
//! ```
//!
//! ## Lookup Rules
//!
//! - Exact line, closest segment at or before the column
//! - Otherwise, with [`Bias::LeastUpperBound`], the closest segment after it
//! - No `names` entry: the original line is read (from `sourcesContent` or
//!   disk) and [`extract_function_name`] guesses the name
//! - Nothing found: the location is returned unchanged
//!
//! ## Module Structure
//!
//! - **`parser`**: v3 JSON and VLQ decoding, per-line segment search
//! - **`index`**: discovery, generated-file resolution, profile rewriting
//! - **`names`**: function-name heuristic

pub mod index;
pub mod names;
pub mod parser;

pub use index::{Bias, Location, SourcemapEntry, SourcemapIndex};
pub use names::extract_function_name;
pub use parser::{OriginalPosition, Position, SearchBias, SourceMap};
