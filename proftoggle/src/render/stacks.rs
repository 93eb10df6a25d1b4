//! Flattening a pprof profile into weighted root-to-leaf stacks.

use std::collections::HashMap;

use pprof::protos::Profile;

/// One resolved frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    pub name: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// A call stack, root first, with its aggregated sample value.
#[derive(Debug, Clone)]
pub struct WeightedStack {
    pub frames: Vec<Frame>,
    pub value: i64,
}

/// The profile reduced to what the renderers need.
#[derive(Debug, Clone)]
pub struct ProfileView {
    /// e.g. `cpu`, `inuse_space`
    pub sample_type: String,
    /// e.g. `nanoseconds`, `bytes`
    pub unit: String,
    pub total: i64,
    /// Sorted by value, heaviest first
    pub stacks: Vec<WeightedStack>,
}

impl ProfileView {
    /// Build a view over the profile's default (last) sample type.
    #[must_use]
    pub fn from_profile(profile: &Profile) -> Self {
        let value_index = profile.sample_type.len().saturating_sub(1);
        let (sample_type, unit) = profile
            .sample_type
            .get(value_index)
            .map_or(("samples", "count"), |vt| (string_at(profile, vt.ty), string_at(profile, vt.unit)));

        let functions: HashMap<u64, (&str, &str)> = profile
            .function
            .iter()
            .map(|f| (f.id, (string_at(profile, f.name), string_at(profile, f.filename))))
            .collect();

        let mut locations: HashMap<u64, Vec<Frame>> = HashMap::new();
        for location in &profile.location {
            // pprof lists inlined callees first inside a location
            let frames = location
                .line
                .iter()
                .filter_map(|line| {
                    let (name, file) = functions.get(&line.function_id)?;
                    Some(Frame {
                        name: (*name).to_string(),
                        file: (!file.is_empty()).then(|| (*file).to_string()),
                        line: u32::try_from(line.line).ok().filter(|l| *l > 0),
                    })
                })
                .collect::<Vec<_>>();
            let frames = if frames.is_empty() {
                vec![Frame { name: format!("0x{:x}", location.address), file: None, line: None }]
            } else {
                frames
            };
            locations.insert(location.id, frames);
        }

        let mut merged: HashMap<Vec<Frame>, i64> = HashMap::new();
        for sample in &profile.sample {
            let value = sample.value.get(value_index).copied().unwrap_or(0);
            if value <= 0 {
                continue;
            }
            // Samples are leaf first
            let mut frames: Vec<Frame> = sample
                .location_id
                .iter()
                .filter_map(|id| locations.get(id))
                .flat_map(|frames| frames.iter().cloned())
                .collect();
            if frames.is_empty() {
                continue;
            }
            frames.reverse();
            *merged.entry(frames).or_insert(0) += value;
        }

        let mut stacks: Vec<WeightedStack> =
            merged.into_iter().map(|(frames, value)| WeightedStack { frames, value }).collect();
        stacks.sort_unstable_by(|a, b| b.value.cmp(&a.value).then_with(|| a.frames.len().cmp(&b.frames.len())));
        let total = stacks.iter().map(|s| s.value).sum();

        Self { sample_type: sample_type.to_string(), unit: unit.to_string(), total, stacks }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Number of distinct function names across all stacks.
    #[must_use]
    pub fn function_count(&self) -> usize {
        let mut names: Vec<&str> =
            self.stacks.iter().flat_map(|s| s.frames.iter().map(|f| f.name.as_str())).collect();
        names.sort_unstable();
        names.dedup();
        names.len()
    }

    /// Collapsed-stack lines (`root;child;leaf value`) for inferno.
    #[must_use]
    pub fn folded_lines(&self) -> Vec<String> {
        self.stacks
            .iter()
            .map(|stack| {
                let path = stack
                    .frames
                    .iter()
                    .map(|f| f.name.replace(';', ":"))
                    .collect::<Vec<_>>()
                    .join(";");
                format!("{path} {}", stack.value)
            })
            .collect()
    }
}

fn string_at(profile: &Profile, id: i64) -> &str {
    usize::try_from(id).ok().and_then(|i| profile.string_table.get(i)).map_or("", String::as_str)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use pprof::protos::{Function, Line, Location, Profile, Sample, ValueType};

    /// `main -> work -> hash` (30) and `main -> idle` (10), cpu/nanoseconds.
    pub fn cpu_profile() -> Profile {
        let strings = ["", "samples", "count", "cpu", "nanoseconds", "main", "work", "hash", "idle", "src/main.rs"];
        let function = |id: u64, name: i64| Function { id, name, system_name: name, filename: 9, ..Default::default() };
        let location = |id: u64, function_id: u64| Location {
            id,
            line: vec![Line { function_id, line: i64::try_from(id).unwrap_or(0) * 10, ..Default::default() }],
            ..Default::default()
        };
        Profile {
            sample_type: vec![ValueType { ty: 1, unit: 2 }, ValueType { ty: 3, unit: 4 }],
            sample: vec![
                Sample { location_id: vec![3, 2, 1], value: vec![3, 30], ..Default::default() },
                Sample { location_id: vec![4, 1], value: vec![1, 10], ..Default::default() },
            ],
            location: vec![location(1, 1), location(2, 2), location(3, 3), location(4, 4)],
            function: vec![function(1, 5), function(2, 6), function(3, 7), function(4, 8)],
            string_table: strings.iter().map(ToString::to_string).collect(),
            ..Default::default()
        }
    }
}
