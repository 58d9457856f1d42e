#![forbid(unsafe_code)]

//! Path Planner: template + descriptors → sanitized, collision-free paths.
//!
//! Planning is a pure function of the root, the template and the descriptor
//! set. Descriptors are visited in a canonical order, so the suffixes handed
//! out on collisions never depend on input or completion order.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::model::TrackDescriptor;

/// Longest file or directory name produced, in UTF-8 bytes. Leaves room
/// under the common 255-byte name limit for the extension.
pub const MAX_COMPONENT_BYTES: usize = 240;
const ILLEGAL: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];
const FALLBACK_NAME: &str = "Unknown";

#[derive(Debug, Clone)]
pub struct PathPlanner {
    root: PathBuf,
    template: String,
}

impl PathPlanner {
    /// `template` uses `/` between directories and takes `{artist}`,
    /// `{album}`, `{title}`, `{track}` and `{year}`. The extension is added
    /// from each descriptor's output format.
    pub fn new(root: impl Into<PathBuf>, template: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            template: template.into(),
        }
    }

    /// Returns one destination per descriptor, index-aligned with the input.
    pub fn plan(&self, descriptors: &[TrackDescriptor]) -> Vec<PathBuf> {
        let mut order: Vec<usize> = (0..descriptors.len()).collect();
        order.sort_by(|&a, &b| canonical_key(&descriptors[a]).cmp(&canonical_key(&descriptors[b])));

        let mut used = HashSet::new();
        let mut planned = vec![PathBuf::new(); descriptors.len()];
        for index in order {
            planned[index] = self.place(&descriptors[index], &mut used);
        }
        planned
    }

    fn place(&self, descriptor: &TrackDescriptor, used: &mut HashSet<String>) -> PathBuf {
        let mut components = self.render(descriptor);
        let stem = components.pop().unwrap_or_else(|| FALLBACK_NAME.to_string());
        let dir = components
            .iter()
            .fold(self.root.clone(), |dir, component| dir.join(component));
        let extension = descriptor.format.extension();

        let mut attempt = 1usize;
        loop {
            let name = if attempt == 1 {
                format!("{stem}.{extension}")
            } else {
                let suffix = format!(" ({attempt})");
                let room = MAX_COMPONENT_BYTES.saturating_sub(suffix.len());
                format!("{}{suffix}.{extension}", truncate_bytes(&stem, room).trim_end())
            };
            let candidate = dir.join(name);
            if used.insert(collision_key(&candidate)) {
                return candidate;
            }
            attempt += 1;
        }
    }

    fn render(&self, descriptor: &TrackDescriptor) -> Vec<String> {
        let track = descriptor
            .track_number
            .map(|number| format!("{number:02}"))
            .unwrap_or_default();
        let year = descriptor.year().map(|year| year.to_string()).unwrap_or_default();

        self.template
            .split('/')
            .filter(|part| !part.trim().is_empty())
            .map(|part| {
                let rendered = part
                    .replace("{artist}", &clean_value(&descriptor.artist))
                    .replace("{album}", &clean_value(&descriptor.album))
                    .replace("{title}", &clean_value(&descriptor.title))
                    .replace("{track}", &track)
                    .replace("{year}", &year);
                let rendered = if part.starts_with("{track}") && track.is_empty() {
                    rendered.trim_start_matches([' ', '-', '.', '_']).to_string()
                } else {
                    rendered
                };
                sanitize_component(&rendered)
            })
            .collect()
    }
}

/// Keeps separators inside values from opening new directories.
fn clean_value(value: &str) -> String {
    value.replace(['/', '\\'], "_")
}

fn canonical_key(descriptor: &TrackDescriptor) -> (String, Option<u32>, &str) {
    (
        descriptor.identity_key(),
        descriptor.track_number,
        descriptor.stream_url.as_str(),
    )
}

/// Paths differing only in case collide on case-insensitive filesystems.
fn collision_key(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

/// Makes one path component safe on every mainstream filesystem.
pub fn sanitize_component(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| {
            if c.is_control() || ILLEGAL.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = trim_edges(&collapsed);
    let capped = trim_edges(truncate_bytes(trimmed, MAX_COMPONENT_BYTES));
    if capped.is_empty() {
        return FALLBACK_NAME.to_string();
    }

    let base = capped.split('.').next().unwrap_or(capped).to_ascii_uppercase();
    if RESERVED.contains(&base.as_str()) {
        return format!("_{capped}");
    }
    capped.to_string()
}

fn trim_edges(value: &str) -> &str {
    value
        .trim_start_matches(['.', ' '])
        .trim_end_matches(['.', ' '])
}

/// Longest prefix of `value` that fits in `max` bytes without splitting a
/// character.
fn truncate_bytes(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OutputFormat;
    use crate::test_support::track;

    fn planner() -> PathPlanner {
        PathPlanner::new("/music", crate::config::DEFAULT_TEMPLATE)
    }

    #[test]
    fn default_template_layout() {
        let paths = planner().plan(&[track("First", 3, "Song")]);
        assert_eq!(
            paths,
            vec![PathBuf::from("/music/Test Artist/First/03 - Song.mp3")]
        );
    }

    #[test]
    fn extension_follows_output_format() {
        let mut descriptor = track("First", 1, "Song");
        descriptor.format = OutputFormat::Flac;
        let paths = planner().plan(&[descriptor]);
        assert_eq!(paths[0].extension().unwrap(), "flac");
    }

    #[test]
    fn illegal_characters_never_reach_the_filesystem() {
        let mut descriptor = track("AC/DC: Live?", 1, "What <is> \"this\"*");
        descriptor.artist = "..".to_string();
        let path = planner().plan(&[descriptor]).remove(0);
        assert_eq!(
            path,
            PathBuf::from("/music/Unknown/AC_DC_ Live_/01 - What _is_ _this__.mp3")
        );
    }

    #[test]
    fn reserved_and_long_names_are_adjusted() {
        assert_eq!(sanitize_component("con"), "_con");
        assert_eq!(sanitize_component("Aux.txt"), "_Aux.txt");
        assert_eq!(sanitize_component("Console"), "Console");
        assert_eq!(sanitize_component("name. "), "name");
        let long = "é".repeat(300);
        assert_eq!(sanitize_component(&long), "é".repeat(MAX_COMPONENT_BYTES / 2));
    }

    #[test]
    fn multibyte_names_fit_the_filesystem_limit() {
        let dir = tempfile::tempdir().unwrap();
        let planner = PathPlanner::new(dir.path(), crate::config::DEFAULT_TEMPLATE);
        let title = "曲".repeat(100);
        let album = "盤".repeat(100);
        let first = track(&album, 1, &title);
        let mut second = track(&album, 1, &format!("{title} "));
        second.stream_url = "https://cdn.example/dup.mp3".to_string();

        let paths = planner.plan(&[first, second]);
        assert_ne!(paths[0], paths[1]);
        for path in &paths {
            for component in path.strip_prefix(dir.path()).unwrap().components() {
                let name = component.as_os_str().to_str().unwrap();
                assert!(name.len() <= 255, "{} bytes: {name}", name.len());
            }
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"audio").unwrap();
        }
        assert!(paths.iter().any(|path| path.to_string_lossy().ends_with(" (2).mp3")));
    }

    #[test]
    fn missing_track_number_drops_the_prefix() {
        let mut descriptor = track("Single", 1, "Alone");
        descriptor.track_number = None;
        let path = planner().plan(&[descriptor]).remove(0);
        assert_eq!(path, PathBuf::from("/music/Test Artist/Single/Alone.mp3"));
    }

    #[test]
    fn collisions_get_stable_suffixes_regardless_of_order() {
        let a = track("Same", 1, "Song");
        let mut b = track("Same", 1, "song ");
        b.stream_url = "https://cdn.example/other.mp3".to_string();
        let c = track("Same", 1, "Other");

        let forward = planner().plan(&[a.clone(), b.clone(), c.clone()]);
        let backward = planner().plan(&[c, b, a]);
        assert_eq!(forward[0], backward[2]);
        assert_eq!(forward[1], backward[1]);
        assert_eq!(forward[2], backward[0]);

        let names: HashSet<String> = forward.iter().map(|path| collision_key(path)).collect();
        assert_eq!(names.len(), 3);
        assert!(forward[0].ends_with("01 - Song.mp3"));
        assert!(forward[1].ends_with("01 - song (2).mp3"));
    }

    #[test]
    fn year_placeholder() {
        let planner = PathPlanner::new("/music", "{artist}/{year} - {album}/{title}");
        let path = planner.plan(&[track("First", 1, "Song")]).remove(0);
        assert_eq!(path, PathBuf::from("/music/Test Artist/2021 - First/Song.mp3"));
    }
}
