//! Configuration layer: sectioned key/value files, reserved-section
//! cascading, cross-file conflict detection, and datasource parsing.
//!
//! The format is deliberately isolated here: the rest of the program only
//! sees `section name → {key → value}` maps, so swapping the on-disk
//! representation later never touches scheduling logic.

pub mod job;

use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::errors::{MonitorError, Result};

/// One section's options, insertion-ordered. Keys are case-sensitive.
pub type Section = IndexMap<String, String>;

/// All sections of one or more files.
pub type SectionMap = IndexMap<String, Section>;

/// Sections that cascade into jobs instead of being jobs themselves:
/// `DEFAULT` and anything starting with `_`.
pub fn is_reserved(name: &str) -> bool {
    name == "DEFAULT" || name.starts_with('_')
}

/// Parse one sectioned config file.
///
/// Rules: `[name]` headers; `key = value` or `key: value` lines; lines
/// whose first non-blank character is `#` or `;` are comments; indented
/// lines continue the previous value (SQL bodies span lines); a duplicated
/// key or section within one file follows last-one-wins.
pub fn read_sections(path: &Path) -> Result<SectionMap> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        MonitorError::Config(format!("can not read config file {}: {err}", path.display()))
    })?;
    parse_sections(&raw, path)
}

fn parse_sections(raw: &str, path: &Path) -> Result<SectionMap> {
    let mut sections = SectionMap::new();
    let mut current_section: Option<String> = None;
    let mut current_key: Option<String> = None;

    for (lineno, line) in raw.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            current_key = None;
            continue;
        }
        if trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }

        // continuation line: indented and following a key
        if line.starts_with([' ', '\t']) {
            if let (Some(section), Some(key)) = (&current_section, &current_key) {
                let value = sections
                    .get_mut(section)
                    .and_then(|s| s.get_mut(key))
                    .expect("continuation follows an inserted key");
                value.push('\n');
                value.push_str(trimmed);
                continue;
            }
        }

        if let Some(header) = trimmed.strip_prefix('[') {
            let name = header.strip_suffix(']').ok_or_else(|| {
                MonitorError::Config(format!(
                    "{}:{}: malformed section header {trimmed:?}",
                    path.display(),
                    lineno + 1
                ))
            })?;
            sections.entry(name.to_string()).or_default();
            current_section = Some(name.to_string());
            current_key = None;
            continue;
        }

        let section = current_section.as_ref().ok_or_else(|| {
            MonitorError::Config(format!(
                "{}:{}: option outside of any section",
                path.display(),
                lineno + 1
            ))
        })?;
        let split_at = trimmed
            .char_indices()
            .find(|(_, c)| *c == '=' || *c == ':')
            .map(|(i, _)| i)
            .ok_or_else(|| {
                MonitorError::Config(format!(
                    "{}:{}: expected `key = value`, found {trimmed:?}",
                    path.display(),
                    lineno + 1
                ))
            })?;
        let key = trimmed[..split_at].trim().to_string();
        let value = trimmed[split_at + 1..].trim().to_string();
        if key.is_empty() {
            return Err(MonitorError::Config(format!(
                "{}:{}: empty option name",
                path.display(),
                lineno + 1
            )));
        }
        sections
            .get_mut(section)
            .expect("section inserted on header")
            .insert(key.clone(), value);
        current_key = Some(key);
    }

    Ok(sections)
}

/// Detect job sections defined in more than one file. Reserved sections
/// may repeat (they merge); everything else conflicting is fatal, reported
/// with the section name and both file paths.
pub fn detect_conflict(paths: &[PathBuf]) -> Result<Option<(String, PathBuf, PathBuf)>> {
    let mut section_lists = Vec::with_capacity(paths.len());
    for path in paths {
        let sections = read_sections(path)?;
        let names: Vec<String> = sections
            .keys()
            .filter(|name| !is_reserved(name))
            .cloned()
            .collect();
        section_lists.push(names);
    }
    for i in 0..paths.len() {
        for j in (i + 1)..paths.len() {
            if let Some(name) = section_lists[i]
                .iter()
                .find(|name| section_lists[j].contains(name))
            {
                return Ok(Some((name.clone(), paths[i].clone(), paths[j].clone())));
            }
        }
    }
    Ok(None)
}

/// Read and merge several files into one section map. Callers are expected
/// to have run [`detect_conflict`] first; repeated sections merge with
/// later files winning per key.
pub fn load_config(paths: &[PathBuf]) -> Result<SectionMap> {
    let mut merged = SectionMap::new();
    for path in paths {
        for (name, options) in read_sections(path)? {
            let section = merged.entry(name).or_default();
            for (key, value) in options {
                section.insert(key, value);
            }
        }
    }
    Ok(merged)
}

/// Resolve one job section with the reserved sections cascaded in: the
/// job's own options win over `_`-templates, which win over `DEFAULT`.
pub fn cascade(sections: &SectionMap, name: &str) -> Option<Section> {
    let own = sections.get(name)?;
    let mut resolved = Section::new();
    if let Some(defaults) = sections.get("DEFAULT") {
        for (k, v) in defaults {
            resolved.insert(k.clone(), v.clone());
        }
    }
    for (section_name, options) in sections {
        if section_name.starts_with('_') {
            for (k, v) in options {
                resolved.insert(k.clone(), v.clone());
            }
        }
    }
    for (k, v) in own {
        resolved.insert(k.clone(), v.clone());
    }
    Some(resolved)
}

/// Named connection parameters, parsed once at startup and immutable
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasourceConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub charset: String,
}

/// Parse the datasource config file: every section is one datasource.
/// Errors here are fatal; nothing can run without valid datasources.
pub fn load_datasources(path: &Path) -> Result<IndexMap<String, DatasourceConfig>> {
    let sections = read_sections(path)?;
    let mut datasources = IndexMap::new();
    for (name, options) in &sections {
        let get = |key: &str| -> Result<String> {
            options.get(key).cloned().ok_or_else(|| {
                MonitorError::Config(format!(
                    "db-config error, datasource {name:?} is missing option {key:?}"
                ))
            })
        };
        let port_raw = get("port")?;
        let port: u16 = port_raw.parse().map_err(|_| {
            MonitorError::Config(format!(
                "db-config error, port should be an integer in 1~65535, but {port_raw:?} got"
            ))
        })?;
        if port == 0 {
            return Err(MonitorError::Config(
                "db-config error, port should be an integer in 1~65535, but 0 got".into(),
            ));
        }
        datasources.insert(
            name.clone(),
            DatasourceConfig {
                name: name.clone(),
                host: get("host")?,
                port,
                user: get("user")?,
                password: get("password")?,
                database: get("database")?,
                charset: options
                    .get("charset")
                    .cloned()
                    .unwrap_or_else(|| "utf8".to_string()),
            },
        );
    }
    Ok(datasources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_cfg(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parses_sections_and_preserves_key_case() {
        let file = write_cfg("[job_a]\nDesc = Upper\ndesc = lower\n");
        let sections = read_sections(file.path()).unwrap();
        let job = &sections["job_a"];
        assert_eq!(job["Desc"], "Upper");
        assert_eq!(job["desc"], "lower");
    }

    #[test]
    fn continuation_lines_extend_values() {
        let file = write_cfg("[job_a]\nsql = SELECT *\n    FROM t\n    WHERE x = 1\n");
        let sections = read_sections(file.path()).unwrap();
        assert_eq!(sections["job_a"]["sql"], "SELECT *\nFROM t\nWHERE x = 1");
    }

    #[test]
    fn last_key_wins_within_one_file() {
        let file = write_cfg("[job_a]\nperiod = day\nperiod = hour\n");
        let sections = read_sections(file.path()).unwrap();
        assert_eq!(sections["job_a"]["period"], "hour");
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let file = write_cfg("# header\n[job_a]\n; note\nperiod = day\n\ndesc = x\n");
        let sections = read_sections(file.path()).unwrap();
        assert_eq!(sections["job_a"].len(), 2);
    }

    #[test]
    fn conflict_detection_reports_name_and_paths() {
        let a = write_cfg("[job_foo]\nperiod = day\n");
        let b = write_cfg("[job_foo]\nperiod = hour\n");
        let paths = vec![a.path().to_path_buf(), b.path().to_path_buf()];
        let (name, first, second) = detect_conflict(&paths).unwrap().unwrap();
        assert_eq!(name, "job_foo");
        assert_eq!(first, paths[0]);
        assert_eq!(second, paths[1]);
    }

    #[test]
    fn reserved_sections_do_not_conflict() {
        let a = write_cfg("[DEFAULT]\nretry_times = 0\n[_tpl]\nx = 1\n[job_a]\nperiod = day\n");
        let b = write_cfg("[DEFAULT]\nretry_times = 2\n[_tpl]\nx = 2\n[job_b]\nperiod = day\n");
        let paths = vec![a.path().to_path_buf(), b.path().to_path_buf()];
        assert!(detect_conflict(&paths).unwrap().is_none());
    }

    #[test]
    fn cascade_layers_default_templates_and_own_keys() {
        let file = write_cfg(
            "[DEFAULT]\nretry_times = 0\nperiod = day\n[_base]\nperiod = hour\n[job_a]\ndesc = mine\n",
        );
        let sections = read_sections(file.path()).unwrap();
        let resolved = cascade(&sections, "job_a").unwrap();
        assert_eq!(resolved["retry_times"], "0");
        assert_eq!(resolved["period"], "hour"); // template over DEFAULT
        assert_eq!(resolved["desc"], "mine");
        assert!(cascade(&sections, "missing").is_none());
    }

    #[test]
    fn datasources_parse_with_port_validation() {
        let file = write_cfg(
            "[main]\nhost = db.internal\nport = 3306\nuser = monitor\npassword = s3cret\ndatabase = stats\ncharset = utf8mb4\n",
        );
        let dbs = load_datasources(file.path()).unwrap();
        assert_eq!(dbs["main"].port, 3306);
        assert_eq!(dbs["main"].charset, "utf8mb4");

        let bad = write_cfg(
            "[main]\nhost = h\nport = zero\nuser = u\npassword = p\ndatabase = d\n",
        );
        assert!(load_datasources(bad.path()).is_err());
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = read_sections(Path::new("/no/such/file.cfg")).unwrap_err();
        assert!(matches!(err, MonitorError::Config(_)));
    }
}
