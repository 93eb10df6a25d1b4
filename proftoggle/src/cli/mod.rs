pub mod args;

pub use args::{Args, Command, RenderArgs, RunArgs, ToggleArgs};
