//! Server-side command handlers
//!
//! Each handler produces the reply lines for one text request. Paths resolve
//! against a per-connection working directory that starts at the server root
//! and never leaves it.

use std::fs;
use std::path::{Component, Path, PathBuf};

use sysinfo::{Disks, System};

use crate::protocol::{reply, verb};

/// One parsed text request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request<'a> {
    List,
    Get(&'a str),
    Upload,
    Pwd,
    Cd(&'a str),
    Delete(&'a str),
    Rename(&'a str),
    Health,
    Unknown(&'a str),
}

impl<'a> Request<'a> {
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((w, r)) => (w, r.trim()),
            None => (line, ""),
        };
        match word {
            verb::LIST => Request::List,
            verb::GET => Request::Get(rest),
            verb::UPLOAD => Request::Upload,
            verb::PWD => Request::Pwd,
            verb::CD => Request::Cd(rest),
            verb::DELETE => Request::Delete(rest),
            verb::RENAME => Request::Rename(rest),
            verb::HEALTH => Request::Health,
            _ => Request::Unknown(line),
        }
    }
}

/// Per-connection command context.
#[derive(Debug, Clone)]
pub struct Session {
    root: PathBuf,
    cwd: PathBuf,
}

impl Session {
    pub fn new(root: &Path) -> Self {
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        Session {
            cwd: root.clone(),
            root,
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Resolve `arg` against the working directory. Absolute paths, `..`
    /// above the root and symlinks leading out of it give `None`.
    pub fn resolve(&self, arg: &str) -> Option<PathBuf> {
        let p = Path::new(arg);
        if arg.contains('\0') || p.is_absolute() {
            return None;
        }
        let mut joined = self.cwd.clone();
        for component in p.components() {
            match component {
                Component::CurDir => {}
                Component::Normal(s) => joined.push(s),
                Component::ParentDir => {
                    if joined == self.root || !joined.pop() {
                        return None;
                    }
                }
                Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        // targets that do not exist yet: only the parent can be canonicalized
        let resolved = if joined.exists() {
            joined.canonicalize().ok()?
        } else {
            let parent = joined.parent()?.canonicalize().ok()?;
            parent.join(joined.file_name()?)
        };
        resolved.starts_with(&self.root).then_some(resolved)
    }

    pub fn list(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.cwd) {
            Ok(rd) => rd,
            Err(e) => {
                log::warn!("list {}: {}", self.cwd.display(), e);
                return vec!["ERROR: Cannot list directory".to_string()];
            }
        };
        let mut rows: Vec<(String, String)> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let row = match entry.file_type() {
                    Ok(t) if t.is_dir() => format!("- [dir] {name} (Directory)"),
                    Ok(t) if t.is_file() => format!("- [file] {name} (File)"),
                    _ => format!("{name} (Other)"),
                };
                (name, row)
            })
            .collect();
        rows.sort();
        let mut lines: Vec<String> = rows.into_iter().map(|(_, row)| row).collect();
        lines.push(reply::END_OF_LIST.to_string());
        lines
    }

    pub fn pwd(&self) -> String {
        if self.cwd.is_dir() {
            self.cwd.display().to_string()
        } else {
            "ERROR: Cannot get current directory".to_string()
        }
    }

    pub fn cd(&mut self, arg: &str) -> &'static str {
        if arg.is_empty() {
            return "ERROR: Cannot change directory";
        }
        match self.resolve(arg) {
            Some(dir) if dir.is_dir() => {
                self.cwd = dir;
                "OK: Directory changed"
            }
            _ => "ERROR: Cannot change directory",
        }
    }

    pub fn delete(&self, arg: &str) -> &'static str {
        if arg.is_empty() {
            return "ERROR: Cannot delete file";
        }
        let Some(path) = self.resolve(arg) else {
            log::warn!("delete {arg}: outside the served root");
            return "ERROR: Cannot delete file";
        };
        match fs::remove_file(path) {
            Ok(()) => "SUCCESS: File deleted",
            Err(e) => {
                log::warn!("delete {arg}: {e}");
                "ERROR: Cannot delete file"
            }
        }
    }

    pub fn rename(&self, args: &str) -> &'static str {
        let mut parts = args.split_whitespace();
        let (Some(from), Some(to), None) = (parts.next(), parts.next(), parts.next()) else {
            return "ERROR: Invalid rename command";
        };
        let (Some(src), Some(dst)) = (self.resolve(from), self.resolve(to)) else {
            log::warn!("rename {from} -> {to}: outside the served root");
            return "ERROR: Cannot rename file";
        };
        match fs::rename(src, dst) {
            Ok(()) => "SUCCESS: File renamed",
            Err(e) => {
                log::warn!("rename {from} -> {to}: {e}");
                "ERROR: Cannot rename file"
            }
        }
    }
}

const UNREADABLE: &str = "Unable to read";

/// Multi-line host report. Fields that cannot be read degrade individually.
pub fn health_report() -> Vec<String> {
    let mut lines = vec!["=== SERVER HEALTH INFORMATION ===".to_string()];

    // usage is a delta between two samples
    let mut sys = System::new();
    sys.refresh_cpu_usage();
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_usage();
    let cpu = sys.global_cpu_usage();
    if cpu.is_finite() {
        lines.push(format!("CPU Usage: {cpu:.2}%"));
    } else {
        lines.push(format!("CPU Usage: {UNREADABLE}"));
    }

    match hostname::get() {
        Ok(name) => lines.push(format!("Hostname: {}", name.to_string_lossy())),
        Err(_) => lines.push(format!("Hostname: {UNREADABLE}")),
    }

    let load = System::load_average();
    lines.push(format!(
        "Load Average: {:.2} {:.2} {:.2}",
        load.one, load.five, load.fifteen
    ));

    match cpu_temperature() {
        Some(c) => lines.push(format!("CPU Temperature: {c} °C")),
        None => lines.push(format!("CPU Temperature: {UNREADABLE}")),
    }

    let disks = Disks::new_with_refreshed_list();
    let root = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .filter(|d| d.total_space() > 0);
    match root {
        Some(d) => {
            let used = d.total_space().saturating_sub(d.available_space());
            lines.push(format!(
                "Disk Usage ('/'): {:.2}%",
                used as f64 / d.total_space() as f64 * 100.0
            ));
        }
        None => lines.push(format!("Disk Usage: {UNREADABLE}")),
    }

    sys.refresh_memory();
    let total = sys.total_memory();
    if total > 0 {
        let free = sys.available_memory();
        let mb = |b: u64| b as f64 / (1024.0 * 1024.0);
        lines.push(format!(
            "RAM Usage: {:.2}%",
            total.saturating_sub(free) as f64 / total as f64 * 100.0
        ));
        lines.push(format!("Total RAM: {:.2} MB", mb(total)));
        lines.push(format!("Free RAM: {:.2} MB", mb(free)));
    } else {
        lines.push(format!("RAM Usage: {UNREADABLE}"));
    }

    let up = System::uptime();
    lines.push(format!(
        "System Uptime: {} hours, {} minutes",
        up / 3600,
        (up % 3600) / 60
    ));

    lines.push("================================".to_string());
    lines
}

fn cpu_temperature() -> Option<i64> {
    let raw = fs::read_to_string("/sys/class/thermal/thermal_zone0/temp").ok()?;
    raw.trim().parse::<i64>().ok().map(|milli| milli / 1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_requests() {
        assert_eq!(Request::parse("ls"), Request::List);
        assert_eq!(Request::parse("get  notes.txt "), Request::Get("notes.txt"));
        assert_eq!(Request::parse("get"), Request::Get(""));
        assert_eq!(Request::parse("upload"), Request::Upload);
        assert_eq!(Request::parse("rename a b"), Request::Rename("a b"));
        assert_eq!(Request::parse("cd sub dir"), Request::Cd("sub dir"));
        assert_eq!(Request::parse("fly away"), Request::Unknown("fly away"));
        assert_eq!(Request::parse(""), Request::Unknown(""));
    }

    #[test]
    fn list_marks_entry_kinds() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let s = Session::new(dir.path());
        assert_eq!(
            s.list(),
            vec!["- [file] a.txt (File)", "- [dir] sub (Directory)", "END_OF_LIST"]
        );
    }

    #[test]
    fn cd_pwd_delete_rename() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let mut s = Session::new(dir.path());
        assert_eq!(s.cd("missing"), "ERROR: Cannot change directory");
        assert_eq!(s.cd("sub"), "OK: Directory changed");
        assert!(s.pwd().ends_with("sub"));

        fs::write(dir.path().join("sub/one"), b"1").unwrap();
        assert_eq!(s.rename("one"), "ERROR: Invalid rename command");
        assert_eq!(s.rename("one two"), "SUCCESS: File renamed");
        assert_eq!(s.rename("one two"), "ERROR: Cannot rename file");
        assert_eq!(s.delete("two"), "SUCCESS: File deleted");
        assert_eq!(s.delete("two"), "ERROR: Cannot delete file");
        assert_eq!(s.cd(".."), "OK: Directory changed");
        assert_eq!(s.cwd(), dir.path().canonicalize().unwrap());
    }

    #[test]
    fn paths_stay_under_the_root() {
        let outer = TempDir::new().unwrap();
        let root = outer.path().join("served");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(outer.path().join("secret"), b"keep").unwrap();
        let mut s = Session::new(&root);

        assert_eq!(s.resolve("/etc/passwd"), None);
        assert_eq!(s.resolve("../secret"), None);
        assert_eq!(s.resolve("sub/../../secret"), None);
        assert_eq!(s.delete("../secret"), "ERROR: Cannot delete file");
        assert_eq!(s.rename("../secret mine"), "ERROR: Cannot rename file");
        assert_eq!(s.cd(".."), "ERROR: Cannot change directory");
        assert_eq!(s.cd("/"), "ERROR: Cannot change directory");
        assert!(outer.path().join("secret").exists());

        let canon = root.canonicalize().unwrap();
        assert_eq!(s.resolve("sub/../a.txt"), Some(canon.join("a.txt")));
        assert_eq!(s.cd("sub"), "OK: Directory changed");
        assert_eq!(s.resolve("../a.txt"), Some(canon.join("a.txt")));
        assert_eq!(s.resolve("../../secret"), None);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_the_root_is_refused() {
        let outer = TempDir::new().unwrap();
        let root = outer.path().join("served");
        fs::create_dir(&root).unwrap();
        fs::write(outer.path().join("secret"), b"keep").unwrap();
        std::os::unix::fs::symlink(outer.path(), root.join("up")).unwrap();
        let mut s = Session::new(&root);

        assert_eq!(s.resolve("up/secret"), None);
        assert_eq!(s.cd("up"), "ERROR: Cannot change directory");
        assert_eq!(s.delete("up/secret"), "ERROR: Cannot delete file");
        assert!(outer.path().join("secret").exists());
    }

    #[test]
    fn health_report_is_framed() {
        let lines = health_report();
        assert_eq!(lines.first().unwrap(), "=== SERVER HEALTH INFORMATION ===");
        assert_eq!(lines.last().unwrap(), "================================");
        assert!(lines[1].starts_with("CPU Usage: "), "{}", lines[1]);
        assert!(lines.iter().any(|l| l.starts_with("System Uptime: ")));
    }
}
