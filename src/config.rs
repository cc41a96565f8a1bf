//! INI configuration loading (ambient stack addition; modeled on the
//! reference's `joule/services/load_config.py`). `[Main]`, `[DataStore]`
//! (folded into `[Main]` by the reference — `InsertPeriod`,
//! `CleanupPeriod`, `MaxLogLines` live alongside `Name`/`Database`),
//! `[Security]` (optional, TLS opportunistic without a CA), and
//! `[Proxies]` (`name = url` entries, out of scope for the core but
//! parsed so the section round-trips). A failing section aborts startup
//! of the whole daemon (there is no "offending entity" narrower than the
//! process for top-level configuration), but never corrupts on-disk
//! state, per §7.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;

use crate::error::ConfigurationError;

#[derive(Clone, Debug)]
pub struct SecurityConfig {
    pub certificate: PathBuf,
    pub key: PathBuf,
    /// Absent means TLS is opportunistic: the server still terminates
    /// TLS but does not require client verification.
    pub certificate_authority: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub name: String,
    pub url: String,
}

#[derive(Clone, Debug)]
pub struct JouleConfig {
    pub name: String,
    pub module_directory: PathBuf,
    pub stream_directory: PathBuf,
    pub ip_address: IpAddr,
    pub port: u16,
    pub database: String,
    pub insert_period: Duration,
    pub cleanup_period: Duration,
    pub max_log_lines: usize,
    pub security: Option<SecurityConfig>,
    pub proxies: Vec<ProxyConfig>,
}

/// Load and validate `path` as a Joule daemon configuration file. Mirrors
/// `load_config.run(verify=True)`: every check raises `ConfigurationError`
/// rather than panicking, so the caller (daemon startup) can report a
/// clean error and exit with code 1 (spec §6's exit code contract) instead
/// of aborting mid-initialization.
pub fn load(path: &Path, verify: bool) -> Result<JouleConfig, ConfigurationError> {
    let ini = Ini::load_from_file(path)
        .map_err(|e| ConfigurationError::new(format!("cannot read config [{}]: {e}", path.display())))?;

    let main = ini
        .section(Some("Main"))
        .ok_or_else(|| ConfigurationError::new("missing [Main] section"))?;

    let name = get(main, "Name")?;

    let module_directory = PathBuf::from(get(main, "ModuleDirectory")?);
    if verify && !module_directory.is_dir() {
        return Err(ConfigurationError::new(format!(
            "ModuleDirectory [{}] does not exist",
            module_directory.display()
        )));
    }
    let stream_directory = PathBuf::from(get(main, "StreamDirectory")?);
    if verify && !stream_directory.is_dir() {
        return Err(ConfigurationError::new(format!(
            "StreamDirectory [{}] does not exist",
            stream_directory.display()
        )));
    }

    let ip_address = IpAddr::from_str(get(main, "IPAddress")?.trim())
        .map_err(|_| ConfigurationError::new("IPAddress is invalid"))?;

    let port: u16 = get(main, "Port")?
        .trim()
        .parse()
        .map_err(|_| ConfigurationError::new("Port must be between 0 - 65535"))?;

    let database = get(main, "Database")?.to_string();

    let insert_period = positive_seconds(main, "InsertPeriod", "InsertPeriod must be a positive number")?;
    let cleanup_period = positive_seconds(
        main,
        "CleanupPeriod",
        "CleanupPeriod must be a positive number >= InsertPeriod",
    )?;
    if cleanup_period < insert_period {
        return Err(ConfigurationError::new(
            "CleanupPeriod must be a positive number >= InsertPeriod",
        ));
    }

    let max_log_lines: usize = get(main, "MaxLogLines")?
        .trim()
        .parse()
        .ok()
        .filter(|&n: &usize| n > 0)
        .ok_or_else(|| ConfigurationError::new("MaxLogLines must be a positive number"))?;

    let security = match ini.section(Some("Security")) {
        Some(sec) => Some(SecurityConfig {
            certificate: PathBuf::from(get(sec, "Certificate")?),
            key: PathBuf::from(get(sec, "Key")?),
            certificate_authority: sec
                .get("CertificateAuthority")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        }),
        None => None,
    };

    let mut proxies = Vec::new();
    if let Some(proxy_section) = ini.section(Some("Proxies")) {
        for (name, url) in proxy_section.iter() {
            proxies.push(ProxyConfig {
                name: name.to_string(),
                url: url.to_string(),
            });
        }
    }

    Ok(JouleConfig {
        name: name.to_string(),
        module_directory,
        stream_directory,
        ip_address,
        port,
        database,
        insert_period,
        cleanup_period,
        max_log_lines,
        security,
        proxies,
    })
}

fn get<'a>(props: &'a ini::Properties, key: &str) -> Result<&'a str, ConfigurationError> {
    props
        .get(key)
        .ok_or_else(|| ConfigurationError::new(format!("missing [Main].{key}")))
}

fn positive_seconds(
    props: &ini::Properties,
    key: &str,
    msg: &str,
) -> Result<Duration, ConfigurationError> {
    let value: i64 = get(props, key)?
        .trim()
        .parse()
        .map_err(|_| ConfigurationError::new(msg))?;
    if value <= 0 {
        return Err(ConfigurationError::new(msg));
    }
    Ok(Duration::from_secs(value as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn rejects_missing_main_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[Proxies]\nsite1 = http://localhost").unwrap();
        let err = load(file.path(), true).unwrap_err();
        assert!(err.0.contains("Main"));
    }

    #[test]
    fn parses_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let tmp_dir = std::env::temp_dir();
        writeln!(
            file,
            "[Main]\nName = test\nModuleDirectory = {dir}\nStreamDirectory = {dir}\n\
             IPAddress = 127.0.0.1\nPort = 8088\nDatabase = joule:joule@localhost/joule\n\
             InsertPeriod = 5\nCleanupPeriod = 60\nMaxLogLines = 100\n\
             [Proxies]\nsite1 = http://localhost:3000",
            dir = tmp_dir.display()
        )
        .unwrap();
        let cfg = load(file.path(), true).unwrap();
        assert_eq!(cfg.name, "test");
        assert_eq!(cfg.port, 8088);
        assert_eq!(cfg.insert_period, Duration::from_secs(5));
        assert_eq!(cfg.proxies.len(), 1);
    }

    #[test]
    fn skips_directory_checks_when_verify_is_false() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[Main]\nName = test\nModuleDirectory = /no/such/dir\nStreamDirectory = /no/such/dir\n\
             IPAddress = 127.0.0.1\nPort = 8088\nDatabase = joule:joule@localhost/joule\n\
             InsertPeriod = 5\nCleanupPeriod = 60\nMaxLogLines = 100"
        )
        .unwrap();
        let cfg = load(file.path(), false).unwrap();
        assert_eq!(cfg.module_directory, PathBuf::from("/no/such/dir"));
    }
}
