//! Per-device output artifacts.
//!
//! Each device produces exactly one output file per run, named from its IP
//! address and label, containing every command followed by its sanitized
//! output in command-list order. Rendering is deterministic so identical
//! runs produce byte-identical files.

use std::path::{Path, PathBuf};

use log::info;

use crate::error::RunError;

/// Builds the output file name for a device: `output_{ip}_{hostname}.txt`.
///
/// The hostname is reduced to filesystem-safe characters.
pub fn output_file_name(ip: &str, hostname: &str) -> String {
    let safe_host: String = hostname
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    format!("output_{ip}_{safe_host}.txt")
}

/// The full artifact path for a device inside `output_dir`.
pub fn output_path(output_dir: &Path, ip: &str, hostname: &str) -> PathBuf {
    output_dir.join(output_file_name(ip, hostname))
}

/// Renders `(command, sanitized output)` sections into the artifact text.
pub fn render(sections: &[(String, String)]) -> String {
    let mut out = String::new();
    for (command, body) in sections {
        out.push_str(command);
        out.push('\n');
        out.push_str(body);
        if !body.ends_with('\n') {
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

/// Writes the rendered artifact, creating parent directories as needed.
pub async fn write(path: &Path, content: &str) -> Result<(), RunError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;
    info!("output written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_is_derived_from_ip_and_label() {
        assert_eq!(
            output_file_name("192.0.2.10", "edge-1"),
            "output_192.0.2.10_edge-1.txt"
        );
    }

    #[test]
    fn unsafe_hostname_characters_are_replaced() {
        assert_eq!(
            output_file_name("192.0.2.10", "core sw/1"),
            "output_192.0.2.10_core_sw_1.txt"
        );
    }

    #[test]
    fn sections_are_rendered_in_order_with_command_headers() {
        let sections = vec![
            ("show version".to_string(), "Version 1.0".to_string()),
            (
                "show ip interface brief".to_string(),
                "Gi0/0 up\nGi0/1 down".to_string(),
            ),
        ];
        let rendered = render(&sections);
        assert_eq!(
            rendered,
            "show version\nVersion 1.0\n\nshow ip interface brief\nGi0/0 up\nGi0/1 down\n\n"
        );
    }

    #[test]
    fn rendering_is_deterministic() {
        let sections = vec![("show clock".to_string(), "12:00:00".to_string())];
        assert_eq!(render(&sections), render(&sections));
    }

    #[tokio::test]
    async fn write_creates_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("output_192.0.2.1_r1.txt");
        write(&path, "show version\nok\n\n").await.expect("write");
        let read_back = tokio::fs::read_to_string(&path).await.expect("read");
        assert_eq!(read_back, "show version\nok\n\n");
    }
}
