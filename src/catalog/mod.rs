//! Read-only views over the downloads tree.
//!
//! Layout: `{channel}/{beat}/{beat}.mp3`, stems under
//! `{channel}/{beat}/isolated_samples/`, covers under
//! `{channel}/{beat}/ai_covers/`. Every listing is a live scan; nothing
//! is cached between queries.

pub mod stem;

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub use stem::{classify, StemMatch, StemType};

pub const ISOLATED_DIR: &str = "isolated_samples";
pub const COVERS_DIR: &str = "ai_covers";
/// Pre-restructure channel subfolder, skipped by all scans.
pub const LEGACY_SUBDIR: &str = "downloads";
pub const TEMP_DOWNLOAD_DIR: &str = ".temp_download";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub name: String,
    pub count: usize,
    pub has_isolated: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeatSummary {
    pub name: String,
    pub has_isolated: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StemFile {
    pub name: String,
    #[serde(rename = "type")]
    pub stem_type: StemType,
    /// Path relative to the downloads root.
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleStem {
    pub name: String,
    pub beat: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelSamples {
    pub name: String,
    pub stems: Vec<SampleStem>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    pub local_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_kb: Option<u64>,
    pub remote_enabled: bool,
}

#[derive(Clone)]
pub struct Catalog {
    root: PathBuf,
}

impl Catalog {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn channel_dir(&self, channel: &str) -> PathBuf {
        self.root.join(channel)
    }

    pub fn beat_dir(&self, channel: &str, beat: &str) -> PathBuf {
        self.root.join(channel).join(beat)
    }

    pub fn isolated_dir(&self, channel: &str, beat: &str) -> PathBuf {
        self.beat_dir(channel, beat).join(ISOLATED_DIR)
    }

    pub fn covers_dir(&self, channel: &str, beat: &str) -> PathBuf {
        self.beat_dir(channel, beat).join(COVERS_DIR)
    }

    pub fn staging_dir(&self, channel: &str) -> PathBuf {
        self.channel_dir(channel).join(TEMP_DOWNLOAD_DIR)
    }

    /// Channel folders with their beat counts.
    pub fn list_channels(&self) -> Vec<ChannelSummary> {
        let mut channels: Vec<ChannelSummary> = visible_dirs(&self.root)
            .into_iter()
            .map(|name| {
                let beats = self.list_beats(&name);
                ChannelSummary {
                    count: beats.len(),
                    has_isolated: beats.iter().any(|b| b.has_isolated),
                    name,
                }
            })
            .collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        channels
    }

    /// Beat folders of one channel. Missing channel yields an empty list.
    pub fn list_beats(&self, channel: &str) -> Vec<BeatSummary> {
        let channel_dir = self.channel_dir(channel);
        let mut beats: Vec<BeatSummary> = visible_dirs(&channel_dir)
            .into_iter()
            .filter(|name| name != LEGACY_SUBDIR)
            .map(|name| BeatSummary {
                has_isolated: has_stems(&channel_dir.join(&name)),
                name,
            })
            .collect();
        beats.sort_by(|a, b| a.name.cmp(&b.name));
        beats
    }

    /// Typed stems of one beat. Files with unrecognized suffixes are
    /// omitted.
    pub fn list_stems(&self, channel: &str, beat: &str) -> Vec<StemFile> {
        let iso_dir = self.isolated_dir(channel, beat);
        let mut stems: Vec<StemFile> = mp3_files(&iso_dir)
            .into_iter()
            .filter_map(|name| {
                let stem_type = classify(&name).known()?;
                Some(StemFile {
                    path: format!("{channel}/{beat}/{ISOLATED_DIR}/{name}"),
                    name,
                    stem_type,
                    remote_url: None,
                })
            })
            .collect();
        stems.sort_by(|a, b| a.name.cmp(&b.name));
        stems
    }

    /// All isolated stems grouped by channel.
    pub fn list_samples(&self) -> Vec<ChannelSamples> {
        let mut out = Vec::new();
        for channel in self.list_channels() {
            let mut stems = Vec::new();
            for beat in self.list_beats(&channel.name) {
                for stem in self.list_stems(&channel.name, &beat.name) {
                    stems.push(SampleStem {
                        name: stem.name,
                        beat: beat.name.clone(),
                    });
                }
            }
            if !stems.is_empty() {
                out.push(ChannelSamples {
                    name: channel.name,
                    count: stems.len(),
                    stems,
                });
            }
        }
        out
    }

    /// Beats of a channel that have a source mp3 to separate, with the
    /// audio file path. A specific beat narrows the set to one.
    pub fn beats_with_audio(&self, channel: &str, beat: Option<&str>) -> Vec<(String, PathBuf)> {
        let beats: Vec<String> = match beat {
            Some(b) => vec![b.to_string()],
            None => self.list_beats(channel).into_iter().map(|b| b.name).collect(),
        };
        beats
            .into_iter()
            .filter_map(|name| {
                let dir = self.beat_dir(channel, &name);
                let audio = mp3_files(&dir).into_iter().next()?;
                Some((name, dir.join(audio)))
            })
            .collect()
    }

    /// Recursive byte total of the downloads tree.
    pub fn local_size_bytes(&self) -> u64 {
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }
}

fn visible_dirs(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| !name.starts_with('.'))
        .collect()
}

fn mp3_files(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|e| e.path().is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.to_lowercase().ends_with(".mp3"))
        .collect()
}

fn has_stems(beat_dir: &Path) -> bool {
    !mp3_files(&beat_dir.join(ISOLATED_DIR)).is_empty()
}

/// Whether a client-supplied channel or beat name stays inside the
/// downloads root when joined onto it.
pub fn valid_name(name: &str) -> bool {
    !name.trim().is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}
