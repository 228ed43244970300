use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub timing: Option<TimingConfig>,
    pub scholar: Option<ScholarConfig>,
    pub clipboard: Option<ClipboardConfig>,
    pub layout: Option<LayoutConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingConfig {
    pub observe_timeout_ms: Option<u64>,
    pub load_slack_ms: Option<u64>,
    pub batch_stagger_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScholarConfig {
    pub base_url: Option<String>,
    pub user_agent: Option<String>,
    pub requests_per_second: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClipboardConfig {
    pub strategies: Option<Vec<String>>,
    pub output_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayoutConfig {
    pub result_item: Option<String>,
    pub result_container: Option<String>,
    pub cluster_attr: Option<String>,
    pub trigger: Option<String>,
    pub close_control: Option<String>,
    pub popup_roots: Option<Vec<String>>,
    pub link_label: Option<String>,
}

/// Platform config directory path: `<config_dir>/citegrab/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("citegrab").join("config.toml"))
}

/// Load config by cascading CWD `.citegrab.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(".citegrab.toml"));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &Path) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparsable config file");
            None
        }
    }
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    let timing = merge_section(base.timing, overlay.timing, |b, o| TimingConfig {
        observe_timeout_ms: o.observe_timeout_ms.or(b.observe_timeout_ms),
        load_slack_ms: o.load_slack_ms.or(b.load_slack_ms),
        batch_stagger_ms: o.batch_stagger_ms.or(b.batch_stagger_ms),
    });
    let scholar = merge_section(base.scholar, overlay.scholar, |b, o| ScholarConfig {
        base_url: o.base_url.or(b.base_url),
        user_agent: o.user_agent.or(b.user_agent),
        requests_per_second: o.requests_per_second.or(b.requests_per_second),
    });
    let clipboard = merge_section(base.clipboard, overlay.clipboard, |b, o| ClipboardConfig {
        strategies: o.strategies.or(b.strategies),
        output_path: o.output_path.or(b.output_path),
    });
    let layout = merge_section(base.layout, overlay.layout, |b, o| LayoutConfig {
        result_item: o.result_item.or(b.result_item),
        result_container: o.result_container.or(b.result_container),
        cluster_attr: o.cluster_attr.or(b.cluster_attr),
        trigger: o.trigger.or(b.trigger),
        close_control: o.close_control.or(b.close_control),
        popup_roots: o.popup_roots.or(b.popup_roots),
        link_label: o.link_label.or(b.link_label),
    });

    ConfigFile {
        timing,
        scholar,
        clipboard,
        layout,
    }
}

fn merge_section<T>(base: Option<T>, overlay: Option<T>, combine: impl FnOnce(T, T) -> T) -> Option<T> {
    match (base, overlay) {
        (None, None) => None,
        (Some(b), None) => Some(b),
        (None, Some(o)) => Some(o),
        (Some(b), Some(o)) => Some(combine(b, o)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_partial_file() {
        let toml_str = r##"
[timing]
observe_timeout_ms = 4000

[layout]
trigger = ".gs_or_cit"
popup_roots = ["#gs_cit"]
"##;
        let config: ConfigFile = toml::from_str(toml_str).unwrap();
        assert_eq!(config.timing.as_ref().unwrap().observe_timeout_ms, Some(4000));
        assert!(config.timing.as_ref().unwrap().batch_stagger_ms.is_none());
        assert!(config.scholar.is_none());
        let layout = config.layout.unwrap();
        assert_eq!(layout.popup_roots, Some(vec!["#gs_cit".to_string()]));
    }

    #[test]
    fn merge_overlay_wins_field_by_field() {
        let base = ConfigFile {
            timing: Some(TimingConfig {
                observe_timeout_ms: Some(3000),
                load_slack_ms: Some(1000),
                batch_stagger_ms: None,
            }),
            scholar: Some(ScholarConfig {
                base_url: Some("https://scholar.google.com".into()),
                ..ScholarConfig::default()
            }),
            ..ConfigFile::default()
        };
        let overlay = ConfigFile {
            timing: Some(TimingConfig {
                observe_timeout_ms: Some(5000),
                ..TimingConfig::default()
            }),
            clipboard: Some(ClipboardConfig {
                strategies: Some(vec!["memory".into()]),
                output_path: None,
            }),
            ..ConfigFile::default()
        };

        let merged = merge(base, overlay);
        let timing = merged.timing.unwrap();
        assert_eq!(timing.observe_timeout_ms, Some(5000));
        assert_eq!(timing.load_slack_ms, Some(1000));
        assert_eq!(
            merged.scholar.unwrap().base_url.as_deref(),
            Some("https://scholar.google.com")
        );
        assert_eq!(
            merged.clipboard.unwrap().strategies,
            Some(vec!["memory".to_string()])
        );
        assert!(merged.layout.is_none());
    }

    #[test]
    fn load_from_missing_or_broken_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_from_path(&dir.path().join("missing.toml")).is_none());

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "[timing\nobserve_timeout_ms = ").unwrap();
        assert!(load_from_path(&broken).is_none());

        let good = dir.path().join("good.toml");
        std::fs::write(&good, "[scholar]\nrequests_per_second = 2\n").unwrap();
        let config = load_from_path(&good).unwrap();
        assert_eq!(config.scholar.unwrap().requests_per_second, Some(2));
    }
}
