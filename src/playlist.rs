#![forbid(unsafe_code)]

//! Playlist Writer: one `.m3u` per album once all of its jobs are terminal.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use log::{debug, info};

use crate::model::{AlbumKey, JobId, JobStatus, TrackDescriptor};
use crate::planner::sanitize_component;

#[derive(Debug, Clone)]
struct PlaylistEntry {
    track_number: Option<u32>,
    order: usize,
    artist: String,
    title: String,
    path: PathBuf,
}

/// Jobs sharing an artist+album key. Dropped once its playlist is written
/// or every job has failed.
#[derive(Debug, Default)]
struct AlbumGroup {
    artist: String,
    album: String,
    pending: HashSet<JobId>,
    entries: Vec<PlaylistEntry>,
    registered: usize,
}

#[derive(Debug, Default)]
pub struct PlaylistWriter {
    playlist_dir: Option<PathBuf>,
    groups: HashMap<AlbumKey, AlbumGroup>,
    jobs: HashMap<JobId, (AlbumKey, usize)>,
}

impl PlaylistWriter {
    /// Playlists go next to the tracks unless `playlist_dir` is given.
    pub fn new(playlist_dir: Option<PathBuf>) -> Self {
        Self {
            playlist_dir,
            ..Self::default()
        }
    }

    pub fn register(&mut self, id: JobId, descriptor: &TrackDescriptor) {
        let key = descriptor.album_key();
        let group = self.groups.entry(key.clone()).or_insert_with(|| AlbumGroup {
            artist: descriptor.artist.clone(),
            album: descriptor.album.clone(),
            ..AlbumGroup::default()
        });
        group.pending.insert(id);
        self.jobs.insert(id, (key, group.registered));
        group.registered += 1;
    }

    /// Records a terminal job. Returns the playlist path when this job was
    /// the last one its album was waiting for.
    pub fn record(
        &mut self,
        id: JobId,
        descriptor: &TrackDescriptor,
        destination: &Path,
        status: JobStatus,
    ) -> io::Result<Option<PathBuf>> {
        let Some((key, order)) = self.jobs.remove(&id) else {
            return Ok(None);
        };
        let Some(group) = self.groups.get_mut(&key) else {
            return Ok(None);
        };
        group.pending.remove(&id);
        if matches!(status, JobStatus::Done | JobStatus::Skipped) {
            group.entries.push(PlaylistEntry {
                track_number: descriptor.track_number,
                order,
                artist: descriptor.artist.clone(),
                title: descriptor.title.clone(),
                path: destination.to_path_buf(),
            });
        }
        if !group.pending.is_empty() {
            return Ok(None);
        }

        let Some(group) = self.groups.remove(&key) else {
            return Ok(None);
        };
        if group.entries.is_empty() {
            debug!("No playable tracks for {} - {}, no playlist", group.artist, group.album);
            return Ok(None);
        }
        let path = self.write_group(group)?;
        info!("Wrote playlist {}", path.display());
        Ok(Some(path))
    }

    /// Albums still waiting on at least one job.
    pub fn open_groups(&self) -> usize {
        self.groups.len()
    }

    fn write_group(&self, mut group: AlbumGroup) -> io::Result<PathBuf> {
        group
            .entries
            .sort_by_key(|entry| (entry.track_number.unwrap_or(u32::MAX), entry.order));

        let (dir, name) = match &self.playlist_dir {
            Some(dir) => (
                dir.clone(),
                sanitize_component(&format!("{} - {}", group.artist, group.album)),
            ),
            None => {
                let dir = group.entries[0]
                    .path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                (dir, sanitize_component(&group.album))
            }
        };
        std::fs::create_dir_all(&dir)?;
        let target = dir.join(format!("{name}.m3u"));

        let mut body = String::from("#EXTM3U\n");
        for entry in &group.entries {
            let location = relative_to(&entry.path, &dir);
            body.push_str(&format!(
                "#EXTINF:-1,{} - {}\n{}\n",
                entry.artist,
                entry.title,
                location.to_string_lossy()
            ));
        }

        let mut staged = tempfile::Builder::new().prefix(".playlist").tempfile_in(&dir)?;
        staged.write_all(body.as_bytes())?;
        staged.flush()?;
        staged.persist(&target).map_err(|err| err.error)?;
        Ok(target)
    }
}

/// `path` expressed relative to `base`, falling back to the absolute path
/// when they share no prefix.
fn relative_to(path: &Path, base: &Path) -> PathBuf {
    let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let base = std::path::absolute(base).unwrap_or_else(|_| base.to_path_buf());

    let path_parts: Vec<Component> = path.components().collect();
    let base_parts: Vec<Component> = base.components().collect();
    let common = path_parts
        .iter()
        .zip(&base_parts)
        .take_while(|(a, b)| a == b)
        .count();
    if common == 0 {
        return path;
    }

    let mut relative = PathBuf::new();
    for _ in common..base_parts.len() {
        relative.push("..");
    }
    for part in &path_parts[common..] {
        relative.push(part.as_os_str());
    }
    relative
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::track;
    use tempfile::tempdir;

    fn album_path(root: &Path, name: &str) -> PathBuf {
        root.join("Test Artist/First").join(name)
    }

    #[test]
    fn failed_track_is_omitted_and_order_follows_track_numbers() {
        let dir = tempdir().unwrap();
        let tracks = [
            track("First", 1, "One"),
            track("First", 2, "Two"),
            track("First", 3, "Three"),
        ];
        let mut writer = PlaylistWriter::new(None);
        for (id, descriptor) in tracks.iter().enumerate() {
            writer.register(id, descriptor);
        }

        let three = album_path(dir.path(), "03 - Three.mp3");
        let one = album_path(dir.path(), "01 - One.mp3");
        assert_eq!(writer.record(2, &tracks[2], &three, JobStatus::Done).unwrap(), None);
        assert_eq!(
            writer
                .record(1, &tracks[1], &album_path(dir.path(), "02 - Two.mp3"), JobStatus::Failed)
                .unwrap(),
            None
        );
        let written = writer
            .record(0, &tracks[0], &one, JobStatus::Skipped)
            .unwrap()
            .unwrap();

        assert_eq!(written, album_path(dir.path(), "First.m3u"));
        let body = std::fs::read_to_string(&written).unwrap();
        assert_eq!(
            body,
            "#EXTM3U\n#EXTINF:-1,Test Artist - One\n01 - One.mp3\n#EXTINF:-1,Test Artist - Three\n03 - Three.mp3\n"
        );
        assert_eq!(writer.open_groups(), 0);
    }

    #[test]
    fn all_failed_album_writes_nothing() {
        let dir = tempdir().unwrap();
        let descriptor = track("Lost", 1, "Gone");
        let mut writer = PlaylistWriter::new(None);
        writer.register(7, &descriptor);
        let result = writer
            .record(7, &descriptor, &album_path(dir.path(), "01 - Gone.mp3"), JobStatus::Failed)
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(writer.open_groups(), 0);
    }

    #[test]
    fn separate_playlist_dir_uses_relative_paths() {
        let dir = tempdir().unwrap();
        let lists = dir.path().join("playlists");
        let descriptor = track("First", 1, "One");
        let mut writer = PlaylistWriter::new(Some(lists.clone()));
        writer.register(0, &descriptor);
        let written = writer
            .record(0, &descriptor, &album_path(dir.path(), "01 - One.mp3"), JobStatus::Done)
            .unwrap()
            .unwrap();
        assert_eq!(written, lists.join("Test Artist - First.m3u"));
        let body = std::fs::read_to_string(&written).unwrap();
        assert!(body.contains("../Test Artist/First/01 - One.mp3\n"));
    }

    #[test]
    fn albums_complete_independently() {
        let dir = tempdir().unwrap();
        let a = track("A", 1, "x");
        let b = track("B", 1, "y");
        let mut writer = PlaylistWriter::new(Some(dir.path().to_path_buf()));
        writer.register(0, &a);
        writer.register(1, &b);
        assert!(writer.record(1, &b, &dir.path().join("y.mp3"), JobStatus::Done).unwrap().is_some());
        assert_eq!(writer.open_groups(), 1);
    }
}
