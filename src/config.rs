#![forbid(unsafe_code)]

//! Layered settings for the pipeline and the launcher.
//!
//! Precedence, lowest first: built-in defaults, the `.env` file, process
//! environment, explicit command-line overrides. Every recognized key is
//! listed here; nothing is discovered dynamically.

use anyhow::{Context, Result, bail};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::model::OutputFormat;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DOWNLOAD_ROOT: &str = "downloads";
pub const DEFAULT_TEMPLATE: &str = "{artist}/{album}/{track} - {title}";
pub const DEFAULT_CONCURRENCY: usize = 3;
pub const MAX_CONCURRENCY: usize = 16;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_MS: u64 = 500;
pub const DEFAULT_CODEC: &str = "ffmpeg";
pub const DEFAULT_CODEC_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_EVENT_CAPACITY: usize = 256;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PIPELINE_NAME: &str = "bandfetch";

/// Everything the download pipeline reads from configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub download_root: PathBuf,
    pub temp_dir: PathBuf,
    pub concurrency: usize,
    /// Container of the finished files. Transcoded formats are re-encodings
    /// of the 128 kbps MP3 stream and never carry more fidelity than it.
    pub format: OutputFormat,
    pub template: String,
    pub embed_art: bool,
    pub save_cover: bool,
    pub write_playlists: bool,
    pub playlist_dir: Option<PathBuf>,
    pub retry_on_429: bool,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub codec: PathBuf,
    pub codec_timeout: Duration,
    pub event_capacity: usize,
    pub http_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            download_root: PathBuf::from(DEFAULT_DOWNLOAD_ROOT),
            temp_dir: env::temp_dir().join("bandfetch"),
            concurrency: DEFAULT_CONCURRENCY,
            format: OutputFormat::Original,
            template: DEFAULT_TEMPLATE.to_string(),
            embed_art: true,
            save_cover: false,
            write_playlists: true,
            playlist_dir: None,
            retry_on_429: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_MS),
            codec: PathBuf::from(DEFAULT_CODEC),
            codec_timeout: Duration::from_secs(DEFAULT_CODEC_TIMEOUT_SECS),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }
}

/// Command-line values that win over the file and the environment.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub env_path: Option<PathBuf>,
    pub download_root: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub format: Option<OutputFormat>,
    pub template: Option<String>,
    pub embed_art: Option<bool>,
    pub save_cover: Option<bool>,
    pub write_playlists: Option<bool>,
    pub playlist_dir: Option<PathBuf>,
    pub retry_on_429: Option<bool>,
    pub max_attempts: Option<u32>,
    pub codec: Option<PathBuf>,
}

pub fn resolve_pipeline_settings(overrides: SettingsOverrides) -> Result<PipelineSettings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    let bundled = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().and_then(bundled_codec_in));
    build_pipeline_settings(&file_vars, env_var_string, overrides, bundled)
}

/// A codec shipped next to the executables wins over one found on `PATH`.
pub fn bundled_codec_in(dir: &Path) -> Option<PathBuf> {
    let mut candidate = dir.join(DEFAULT_CODEC);
    if cfg!(windows) {
        candidate.set_extension("exe");
    }
    candidate.is_file().then_some(candidate)
}

fn build_pipeline_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
    bundled_codec: Option<PathBuf>,
) -> Result<PipelineSettings> {
    let defaults = PipelineSettings::default();
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let format = match overrides.format {
        Some(format) => format,
        None => match lookup("BANDFETCH_FORMAT") {
            Some(raw) => match OutputFormat::parse(&raw) {
                Some(format) => format,
                None => bail!("unknown BANDFETCH_FORMAT: {raw}"),
            },
            None => defaults.format,
        },
    };

    let concurrency = overrides
        .concurrency
        .or_else(|| lookup("BANDFETCH_CONCURRENCY").and_then(|v| v.parse().ok()))
        .unwrap_or(defaults.concurrency)
        .clamp(1, MAX_CONCURRENCY);

    let max_attempts = overrides
        .max_attempts
        .or_else(|| lookup("BANDFETCH_MAX_ATTEMPTS").and_then(|v| v.parse().ok()))
        .unwrap_or(defaults.max_attempts)
        .max(1);

    let template = overrides
        .template
        .filter(|value| !value.trim().is_empty())
        .or_else(|| lookup("BANDFETCH_TEMPLATE"))
        .unwrap_or(defaults.template);

    Ok(PipelineSettings {
        download_root: overrides
            .download_root
            .or_else(|| lookup("BANDFETCH_DOWNLOAD_ROOT").map(PathBuf::from))
            .unwrap_or(defaults.download_root),
        temp_dir: overrides
            .temp_dir
            .or_else(|| lookup("BANDFETCH_TEMP_DIR").map(PathBuf::from))
            .unwrap_or(defaults.temp_dir),
        concurrency,
        format,
        template,
        embed_art: overrides
            .embed_art
            .or_else(|| lookup("BANDFETCH_EMBED_ART").and_then(|v| parse_bool(&v)))
            .unwrap_or(defaults.embed_art),
        save_cover: overrides
            .save_cover
            .or_else(|| lookup("BANDFETCH_SAVE_COVER").and_then(|v| parse_bool(&v)))
            .unwrap_or(defaults.save_cover),
        write_playlists: overrides
            .write_playlists
            .or_else(|| lookup("BANDFETCH_PLAYLIST").and_then(|v| parse_bool(&v)))
            .unwrap_or(defaults.write_playlists),
        playlist_dir: overrides
            .playlist_dir
            .or_else(|| lookup("BANDFETCH_PLAYLIST_DIR").map(PathBuf::from)),
        retry_on_429: overrides
            .retry_on_429
            .or_else(|| lookup("BANDFETCH_RETRY_429").and_then(|v| parse_bool(&v)))
            .unwrap_or(defaults.retry_on_429),
        max_attempts,
        backoff_base: lookup("BANDFETCH_BACKOFF_MS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.backoff_base),
        codec: overrides
            .codec
            .or_else(|| lookup("BANDFETCH_CODEC").map(PathBuf::from))
            .or(bundled_codec)
            .unwrap_or(defaults.codec),
        codec_timeout: lookup("BANDFETCH_CODEC_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .filter(|secs: &u64| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.codec_timeout),
        event_capacity: lookup("BANDFETCH_EVENT_CAPACITY")
            .and_then(|v| v.parse().ok())
            .filter(|capacity: &usize| *capacity > 0)
            .unwrap_or(defaults.event_capacity),
        http_timeout: lookup("BANDFETCH_HTTP_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .filter(|secs: &u64| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.http_timeout),
    })
}

/// What the launcher needs before it hands control to the pipeline.
#[derive(Debug, Clone)]
pub struct LauncherSettings {
    pub manifest_url: Option<String>,
    pub pipeline_path: PathBuf,
    /// Base64 ed25519 verifying key. When set, payloads must carry a signature.
    pub public_key: Option<String>,
    pub updates_disabled: bool,
    pub http_timeout: Duration,
}

impl LauncherSettings {
    pub fn version_file(&self) -> PathBuf {
        sibling_with_suffix(&self.pipeline_path, ".version")
    }

    pub fn backup_path(&self) -> PathBuf {
        sibling_with_suffix(&self.pipeline_path, ".backup")
    }

    pub fn status_file(&self) -> PathBuf {
        self.pipeline_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("update_status.json")
    }
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

#[derive(Debug, Clone, Default)]
pub struct LauncherOverrides {
    pub env_path: Option<PathBuf>,
    pub manifest_url: Option<String>,
    pub pipeline_path: Option<PathBuf>,
    pub updates_disabled: bool,
}

pub fn resolve_launcher_settings(overrides: LauncherOverrides) -> Result<LauncherSettings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    let default_pipeline = default_pipeline_path()?;
    Ok(build_launcher_settings(
        &file_vars,
        env_var_string,
        overrides,
        default_pipeline,
    ))
}

fn build_launcher_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: LauncherOverrides,
    default_pipeline: PathBuf,
) -> LauncherSettings {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    LauncherSettings {
        manifest_url: overrides
            .manifest_url
            .or_else(|| lookup("BANDFETCH_UPDATE_MANIFEST_URL")),
        pipeline_path: overrides
            .pipeline_path
            .or_else(|| lookup("BANDFETCH_PIPELINE_PATH").map(PathBuf::from))
            .unwrap_or(default_pipeline),
        public_key: lookup("BANDFETCH_UPDATE_PUBLIC_KEY"),
        updates_disabled: overrides.updates_disabled
            || lookup("BANDFETCH_UPDATE_DISABLED")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(false),
        http_timeout: lookup("BANDFETCH_HTTP_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .filter(|secs: &u64| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS)),
    }
}

/// The pipeline lives next to the launcher executable.
fn default_pipeline_path() -> Result<PathBuf> {
    let mut path = env::current_exe().context("locating launcher executable")?;
    path.set_file_name(DEFAULT_PIPELINE_NAME);
    if cfg!(windows) {
        path.set_extension("exe");
    }
    Ok(path)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> PipelineSettings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_pipeline_settings(&vars, |_| None, SettingsOverrides::default(), None).unwrap()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let settings = settings_from("");
        assert_eq!(settings.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(settings.format, OutputFormat::Original);
        assert_eq!(settings.template, DEFAULT_TEMPLATE);
        assert_eq!(settings.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(settings.embed_art);
        assert!(settings.retry_on_429);
        assert!(settings.playlist_dir.is_none());
    }

    #[test]
    fn file_values_are_read() {
        let settings = settings_from(
            "BANDFETCH_CONCURRENCY=\"5\"\nBANDFETCH_FORMAT=flac\nBANDFETCH_EMBED_ART=no\nBANDFETCH_BACKOFF_MS=10\n",
        );
        assert_eq!(settings.concurrency, 5);
        assert_eq!(settings.format, OutputFormat::Flac);
        assert!(!settings.embed_art);
        assert_eq!(settings.backoff_base, Duration::from_millis(10));
    }

    #[test]
    fn codec_next_to_the_binaries_is_preferred_over_path() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(bundled_codec_in(dir.path()), None);
        let mut shipped = dir.path().join(DEFAULT_CODEC);
        if cfg!(windows) {
            shipped.set_extension("exe");
        }
        fs::write(&shipped, b"").unwrap();
        let found = bundled_codec_in(dir.path());
        assert_eq!(found.as_deref(), Some(shipped.as_path()));

        let vars = HashMap::new();
        let settings =
            build_pipeline_settings(&vars, |_| None, SettingsOverrides::default(), found.clone()).unwrap();
        assert_eq!(settings.codec, shipped);

        let mut configured = HashMap::new();
        configured.insert("BANDFETCH_CODEC".to_string(), "/opt/ffmpeg".to_string());
        let settings =
            build_pipeline_settings(&configured, |_| None, SettingsOverrides::default(), found).unwrap();
        assert_eq!(settings.codec, PathBuf::from("/opt/ffmpeg"));

        let settings = build_pipeline_settings(&vars, |_| None, SettingsOverrides::default(), None).unwrap();
        assert_eq!(settings.codec, PathBuf::from(DEFAULT_CODEC));
    }

    #[test]
    fn concurrency_is_clamped() {
        assert_eq!(settings_from("BANDFETCH_CONCURRENCY=0\n").concurrency, 1);
        assert_eq!(
            settings_from("BANDFETCH_CONCURRENCY=500\n").concurrency,
            MAX_CONCURRENCY
        );
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let settings = settings_from("BANDFETCH_MAX_ATTEMPTS=lots\nBANDFETCH_CODEC_TIMEOUT_SECS=0\n");
        assert_eq!(settings.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(
            settings.codec_timeout,
            Duration::from_secs(DEFAULT_CODEC_TIMEOUT_SECS)
        );
    }

    #[test]
    fn unknown_format_is_rejected() {
        let cfg = make_config("BANDFETCH_FORMAT=aiff\n");
        let vars = read_env_file(cfg.path()).unwrap();
        let err = build_pipeline_settings(&vars, |_| None, SettingsOverrides::default(), None)
            .unwrap_err();
        assert!(err.to_string().contains("aiff"));
    }

    #[test]
    fn env_wins_over_file_and_overrides_win_over_env() {
        let vars = read_env_file(
            make_config("BANDFETCH_DOWNLOAD_ROOT=\"/file\"\nBANDFETCH_CONCURRENCY=2\n").path(),
        )
        .unwrap();
        let env = |key: &str| match key {
            "BANDFETCH_DOWNLOAD_ROOT" => Some("/env".to_string()),
            "BANDFETCH_CONCURRENCY" => Some("4".to_string()),
            _ => None,
        };
        let settings =
            build_pipeline_settings(&vars, env, SettingsOverrides::default(), None).unwrap();
        assert_eq!(settings.download_root, PathBuf::from("/env"));
        assert_eq!(settings.concurrency, 4);

        let settings = build_pipeline_settings(
            &vars,
            env,
            SettingsOverrides {
                concurrency: Some(1),
                format: Some(OutputFormat::Ogg),
                ..SettingsOverrides::default()
            },
            None,
        )
        .unwrap();
        assert_eq!(settings.concurrency, 1);
        assert_eq!(settings.format, OutputFormat::Ogg);
        assert_eq!(settings.download_root, PathBuf::from("/env"));
    }

    #[test]
    fn blank_template_override_is_ignored() {
        let settings = build_pipeline_settings(
            &HashMap::new(),
            |_| None,
            SettingsOverrides {
                template: Some("   ".into()),
                ..SettingsOverrides::default()
            },
            None,
        )
        .unwrap();
        assert_eq!(settings.template, DEFAULT_TEMPLATE);
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export BANDFETCH_DOWNLOAD_ROOT="/music"
            BANDFETCH_TEMPLATE='{artist}/{title}'
            BANDFETCH_FORMAT =  "wav"
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("BANDFETCH_DOWNLOAD_ROOT").unwrap(), "/music");
        assert_eq!(vars.get("BANDFETCH_TEMPLATE").unwrap(), "{artist}/{title}");
        assert_eq!(vars.get("BANDFETCH_FORMAT").unwrap(), "wav");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn launcher_settings_derive_sibling_files() {
        let vars = read_env_file(
            make_config(
                "BANDFETCH_UPDATE_MANIFEST_URL=https://example.com/manifest.json\nBANDFETCH_UPDATE_DISABLED=1\n",
            )
            .path(),
        )
        .unwrap();
        let settings = build_launcher_settings(
            &vars,
            |_| None,
            LauncherOverrides::default(),
            PathBuf::from("/opt/bandfetch/bandfetch"),
        );
        assert_eq!(
            settings.manifest_url.as_deref(),
            Some("https://example.com/manifest.json")
        );
        assert!(settings.updates_disabled);
        assert_eq!(
            settings.version_file(),
            PathBuf::from("/opt/bandfetch/bandfetch.version")
        );
        assert_eq!(
            settings.backup_path(),
            PathBuf::from("/opt/bandfetch/bandfetch.backup")
        );
        assert_eq!(
            settings.status_file(),
            PathBuf::from("/opt/bandfetch/update_status.json")
        );
    }

    #[test]
    fn launcher_override_pipeline_path_wins() {
        let settings = build_launcher_settings(
            &HashMap::new(),
            |key| (key == "BANDFETCH_PIPELINE_PATH").then(|| "/env/pipeline".to_string()),
            LauncherOverrides {
                pipeline_path: Some(PathBuf::from("/cli/pipeline")),
                ..LauncherOverrides::default()
            },
            PathBuf::from("/default/bandfetch"),
        );
        assert_eq!(settings.pipeline_path, PathBuf::from("/cli/pipeline"));
        assert!(!settings.updates_disabled);
    }
}
