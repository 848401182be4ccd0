use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{GridError, Result};

/// Offset of each socket from the configured base port.
///
/// The commander binds all five; a worker connects to all five on the
/// commander's address.
pub const HEARTBEAT_PORT_OFFSET: u16 = 0;
pub const WORK_PORT_OFFSET: u16 = 1;
pub const FILE_PORT_OFFSET: u16 = 2;
pub const RESULT_PORT_OFFSET: u16 = 3;
pub const HEARTBEAT_RESP_PORT_OFFSET: u16 = 4;

#[derive(Debug, Clone)]
pub struct CommanderConfig {
    pub base_port: u16,
    /// Directory holding one subdirectory per student submission.
    pub test_dir: PathBuf,
    /// Shared grading harness, served under the pseudo-key "common".
    pub common_dir: PathBuf,
    /// Wall-clock budget for one command sequence, passed through to workers.
    pub test_timeout: u32,
    /// Heartbeat period, liveness eviction window, and re-queue delay.
    pub client_timeout: u32,
    /// One shell command per line, in execution order.
    pub command_file: PathBuf,
    pub results_dir: PathBuf,
}

impl Default for CommanderConfig {
    fn default() -> Self {
        Self {
            base_port: 5000,
            test_dir: PathBuf::from("./assignments"),
            common_dir: PathBuf::from("./common"),
            test_timeout: 60,
            client_timeout: 10,
            command_file: PathBuf::from("./commands.txt"),
            results_dir: PathBuf::from("./results"),
        }
    }
}

impl CommanderConfig {
    pub fn heartbeat_port(&self) -> u16 {
        self.base_port + HEARTBEAT_PORT_OFFSET
    }

    pub fn work_port(&self) -> u16 {
        self.base_port + WORK_PORT_OFFSET
    }

    pub fn file_port(&self) -> u16 {
        self.base_port + FILE_PORT_OFFSET
    }

    pub fn result_port(&self) -> u16 {
        self.base_port + RESULT_PORT_OFFSET
    }

    pub fn heartbeat_resp_port(&self) -> u16 {
        self.base_port + HEARTBEAT_RESP_PORT_OFFSET
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub remote_ip: String,
    pub remote_port: u16,
    /// Per-assignment working directories are created under here.
    pub work_dir: PathBuf,
    /// Echo endpoint used to discover this worker's public address.
    pub ip_echo_endpoint: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            remote_ip: "127.0.0.1".to_string(),
            remote_port: 5000,
            work_dir: PathBuf::from("./tests"),
            ip_echo_endpoint: crate::worker::ident::DEFAULT_ECHO_ENDPOINT.to_string(),
        }
    }
}

impl WorkerConfig {
    fn remote_addr(&self, offset: u16) -> String {
        format!("{}:{}", self.remote_ip, self.remote_port + offset)
    }

    pub fn heartbeat_addr(&self) -> String {
        self.remote_addr(HEARTBEAT_PORT_OFFSET)
    }

    pub fn work_addr(&self) -> String {
        self.remote_addr(WORK_PORT_OFFSET)
    }

    pub fn file_addr(&self) -> String {
        self.remote_addr(FILE_PORT_OFFSET)
    }

    pub fn result_addr(&self) -> String {
        self.remote_addr(RESULT_PORT_OFFSET)
    }

    pub fn heartbeat_resp_addr(&self) -> String {
        self.remote_addr(HEARTBEAT_RESP_PORT_OFFSET)
    }
}

/// Load the command sequence, one shell command per line, preserving order.
/// Lines are kept verbatim apart from newline removal; blank lines are
/// skipped.
pub fn read_command_file(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path).map_err(|e| {
        GridError::Config(format!("cannot read command file {}: {e}", path.display()))
    })?;

    let commands: Vec<String> = contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.to_string())
        .collect();

    if commands.is_empty() {
        return Err(GridError::Config(format!(
            "command file {} contains no commands",
            path.display()
        )));
    }

    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_port_layout_is_contiguous() {
        let config = CommanderConfig {
            base_port: 6000,
            ..Default::default()
        };
        assert_eq!(config.heartbeat_port(), 6000);
        assert_eq!(config.work_port(), 6001);
        assert_eq!(config.file_port(), 6002);
        assert_eq!(config.result_port(), 6003);
        assert_eq!(config.heartbeat_resp_port(), 6004);
    }

    #[test]
    fn test_command_file_preserves_order_and_content() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "make build").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  ./run_tests --verbose  ").unwrap();

        let commands = read_command_file(file.path()).unwrap();
        assert_eq!(commands, vec!["make build", "  ./run_tests --verbose  "]);
    }

    #[test]
    fn test_empty_command_file_is_a_config_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            read_command_file(file.path()),
            Err(GridError::Config(_))
        ));
    }
}
