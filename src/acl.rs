//! Destination host block-list
//!
//! A flat file of one host per line. Checked against the decoded
//! destination of TCP connections and UDP datagrams before any upstream
//! socket is opened.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

#[derive(Debug, Default)]
pub struct HostBlockList {
    hosts: HashSet<String>,
}

impl HostBlockList {
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<HostBlockList> {
        let file = File::open(path)?;
        let mut hosts = HashSet::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let host = line.trim();
            if !host.is_empty() {
                hosts.insert(host.to_owned());
            }
        }
        Ok(HostBlockList { hosts })
    }

    pub fn contains(&self, host: &str) -> bool {
        self.hosts.contains(host)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_and_matches_hosts() {
        let mut file = tempfile();
        writeln!(file.1, "evil.example.com").unwrap();
        writeln!(file.1, "10.13.37.1").unwrap();
        writeln!(file.1).unwrap();

        let list = HostBlockList::load(&file.0).unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.contains("evil.example.com"));
        assert!(list.contains("10.13.37.1"));
        assert!(!list.contains("example.com"));
    }

    fn tempfile() -> (std::path::PathBuf, File) {
        let path = std::env::temp_dir().join(format!("blocklist-test-{}", std::process::id()));
        let file = File::create(&path).unwrap();
        (path, file)
    }
}
