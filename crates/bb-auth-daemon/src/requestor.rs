//! Requestor resolution: who is actually asking for credentials.
//!
//! A prompt is far more trustworthy when it names the application behind
//! it, so the broker walks the calling process's ancestry through the
//! process-info filesystem and matches each ancestor against an index of
//! installed desktop entries. The walk is bounded, stops at other users'
//! processes (setuid bridges like `pkexec` excepted), and the first
//! desktop match wins.
//!
//! Reads per process are small and bounded: `status` (`Name:`, `PPid:`,
//! `Uid:`), the `exe` symlink, and `cmdline`. Both the proc root and the
//! application directories are injectable so tests can run against a
//! fixture tree.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::agent::session::Requestor;

/// Process metadata read from the proc filesystem.
#[derive(Debug, Clone, Default)]
pub struct ProcInfo {
    pub pid: i32,
    pub ppid: i32,
    pub uid: u32,
    pub name: String,
    pub exe: String,
    pub cmdline: String,
}

/// One installed application entry.
#[derive(Debug, Clone)]
pub struct DesktopEntry {
    pub desktop_id: String,
    pub name: String,
    pub icon: String,
    pub exec: String,
    pub try_exec: String,
}

/// How the requestor identity was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    Desktop,
    ExeOnly,
    NameOnly,
    Unknown,
}

impl Confidence {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::ExeOnly => "exe-only",
            Self::NameOnly => "name-only",
            Self::Unknown => "unknown",
        }
    }
}

/// Resolved requestor identity.
#[derive(Debug, Clone)]
pub struct ActorInfo {
    pub proc: ProcInfo,
    pub desktop: Option<DesktopEntry>,
    pub display_name: String,
    pub icon_name: String,
    pub fallback_letter: String,
    pub fallback_key: String,
    pub confidence: Confidence,
}

impl ActorInfo {
    /// The identity used when the process cannot be read at all.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            proc: ProcInfo::default(),
            desktop: None,
            display_name: "Unknown".to_owned(),
            icon_name: String::new(),
            fallback_letter: "U".to_owned(),
            fallback_key: "unknown".to_owned(),
            confidence: Confidence::Unknown,
        }
    }

    /// Converts into the session-context requestor block.
    #[must_use]
    pub fn to_requestor(&self, pid: Option<i32>) -> Requestor {
        Requestor {
            name: self.display_name.clone(),
            icon: self.icon_name.clone(),
            fallback_letter: self.fallback_letter.clone(),
            fallback_key: self.fallback_key.clone(),
            pid,
        }
    }
}

/// Maximum ancestry hops before giving up.
const MAX_WALK_HOPS: u32 = 16;

/// Setuid bridges that are skipped even when their uid differs.
const SETUID_BRIDGES: &[&str] = &["pkexec", "sudo", "doas"];

fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
}

fn stem(path: &str) -> &str {
    Path::new(path)
        .file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or("")
}

/// Index of installed desktop entries.
#[derive(Default)]
pub struct DesktopIndex {
    entries: Vec<DesktopEntry>,
}

impl DesktopIndex {
    /// Builds the index from the standard application directories:
    /// `$XDG_DATA_HOME/applications` plus each `$XDG_DATA_DIRS` entry.
    #[must_use]
    pub fn load_default() -> Self {
        let mut dirs = Vec::new();

        if let Some(data_home) = std::env::var_os("XDG_DATA_HOME") {
            dirs.push(PathBuf::from(data_home).join("applications"));
        } else if let Some(home) = std::env::var_os("HOME") {
            dirs.push(PathBuf::from(home).join(".local/share/applications"));
        }

        let data_dirs = std::env::var("XDG_DATA_DIRS")
            .unwrap_or_else(|_| "/usr/local/share:/usr/share".to_owned());
        for dir in data_dirs.split(':').filter(|d| !d.is_empty()) {
            dirs.push(PathBuf::from(dir).join("applications"));
        }

        Self::load_from_dirs(&dirs)
    }

    /// Builds the index from explicit directories (tests).
    #[must_use]
    pub fn load_from_dirs(dirs: &[PathBuf]) -> Self {
        let mut entries = Vec::new();
        for dir in dirs {
            collect_desktop_files(dir, &mut entries);
        }
        debug!("desktop index holds {} entries", entries.len());
        Self { entries }
    }

    /// Matches an executable path (or bare process name) against the
    /// index. Five tiers, first match wins:
    ///
    /// 1. exact `<basename>.desktop` id
    /// 2. case-insensitive id
    /// 3. `Exec` basename
    /// 4. `TryExec` basename
    /// 5. `Name` (case-insensitive)
    #[must_use]
    pub fn find_for_exe(&self, exe_path: &str) -> Option<&DesktopEntry> {
        if exe_path.is_empty() {
            return None;
        }
        let base = basename(exe_path);
        if base.is_empty() {
            return None;
        }
        let wanted_id = format!("{base}.desktop");

        self.entries
            .iter()
            .find(|d| d.desktop_id == wanted_id)
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|d| d.desktop_id.eq_ignore_ascii_case(&wanted_id))
            })
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|d| !d.exec.is_empty() && basename(&d.exec) == base)
            })
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|d| !d.try_exec.is_empty() && basename(&d.try_exec) == base)
            })
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|d| d.name.eq_ignore_ascii_case(base))
            })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn collect_desktop_files(dir: &Path, entries: &mut Vec<DesktopEntry>) {
    let Ok(read_dir) = fs::read_dir(dir) else {
        return;
    };
    for entry in read_dir.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_desktop_files(&path, entries);
        } else if path.extension().is_some_and(|ext| ext == "desktop") {
            if let Some(parsed) = parse_desktop_file(&path) {
                entries.push(parsed);
            }
        }
    }
}

/// Parses the `[Desktop Entry]` group of one `.desktop` file.
///
/// Entries with `NoDisplay=true` or without a `Name` are skipped.
fn parse_desktop_file(path: &Path) -> Option<DesktopEntry> {
    let contents = fs::read_to_string(path).ok()?;
    let desktop_id = path.file_name()?.to_str()?.to_owned();

    let mut in_group = false;
    let mut name = String::new();
    let mut icon = String::new();
    let mut exec = String::new();
    let mut try_exec = String::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_group = line == "[Desktop Entry]";
            continue;
        }
        if !in_group || line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "NoDisplay" if value.eq_ignore_ascii_case("true") => return None,
            "Name" if name.is_empty() => name = value.to_owned(),
            "Icon" => icon = value.to_owned(),
            "Exec" => {
                exec = value
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .replace('"', "");
            }
            "TryExec" => try_exec = value.to_owned(),
            _ => {}
        }
    }

    if name.is_empty() {
        return None;
    }

    Some(DesktopEntry {
        desktop_id,
        name,
        icon,
        exec,
        try_exec,
    })
}

/// Resolves requestor identities for peer processes.
pub struct RequestorResolver {
    proc_root: PathBuf,
    agent_uid: u32,
    index: DesktopIndex,
}

impl RequestorResolver {
    /// Production resolver: `/proc`, the calling user's uid, and the
    /// standard application directories.
    #[must_use]
    pub fn new() -> Self {
        Self::with_roots(
            PathBuf::from("/proc"),
            nix::unistd::getuid().as_raw(),
            DesktopIndex::load_default(),
        )
    }

    /// Fully injected constructor (tests).
    #[must_use]
    pub fn with_roots(proc_root: PathBuf, agent_uid: u32, index: DesktopIndex) -> Self {
        Self {
            proc_root,
            agent_uid,
            index,
        }
    }

    /// Reads one process's metadata; `None` when `status` is unreadable.
    #[must_use]
    pub fn read_proc(&self, pid: i32) -> Option<ProcInfo> {
        let dir = self.proc_root.join(pid.to_string());
        let status = fs::read_to_string(dir.join("status")).ok()?;

        let mut info = ProcInfo {
            pid,
            ..ProcInfo::default()
        };
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("Name:") {
                info.name = rest.trim().to_owned();
            } else if let Some(rest) = line.strip_prefix("PPid:") {
                info.ppid = rest.trim().parse().unwrap_or(0);
            } else if let Some(rest) = line.strip_prefix("Uid:") {
                info.uid = rest
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
            }
        }

        // exe may be unreadable for setuid targets; that is fine.
        info.exe = fs::read_link(dir.join("exe"))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        if let Ok(raw) = fs::read(dir.join("cmdline")) {
            let args: Vec<&str> = raw
                .split(|&b| b == 0)
                .filter(|part| !part.is_empty())
                .filter_map(|part| std::str::from_utf8(part).ok())
                .collect();
            info.cmdline = args.join(" ");
        }

        Some(info)
    }

    /// Walks the ancestry starting at `subject_pid` and resolves the
    /// requestor identity.
    #[must_use]
    pub fn resolve(&self, subject_pid: i32) -> ActorInfo {
        let Some(subject) = self.read_proc(subject_pid) else {
            return ActorInfo::unknown();
        };

        let mut actor_proc = subject.clone();
        let mut desktop: Option<DesktopEntry> = None;

        let mut curr_pid = subject.pid;
        let mut hops = 0;

        while curr_pid > 1 && hops < MAX_WALK_HOPS {
            let Some(info) = self.read_proc(curr_pid) else {
                debug!("requestor walk: cannot read pid {curr_pid}");
                break;
            };

            let is_bridge = SETUID_BRIDGES.contains(&info.name.as_str());

            // Another user's process ends the walk unless it is a known
            // setuid bridge (or the agent itself runs as root).
            if info.uid != self.agent_uid && self.agent_uid != 0 && !is_bridge {
                debug!("requestor walk: stopping at pid {} (uid mismatch)", info.pid);
                break;
            }

            if !is_bridge && info.uid == self.agent_uid {
                actor_proc = info.clone();
            }

            let matched = self
                .index
                .find_for_exe(&info.exe)
                .or_else(|| self.index.find_for_exe(&info.name));
            if let Some(entry) = matched {
                debug!(
                    "requestor walk: pid {} matched desktop entry {}",
                    info.pid, entry.desktop_id
                );
                actor_proc = info.clone();
                desktop = Some(entry.clone());
                break;
            }

            if info.ppid <= 1 || info.ppid == curr_pid {
                break;
            }
            curr_pid = info.ppid;
            hops += 1;
        }

        self.finish_actor(actor_proc, desktop)
    }

    fn finish_actor(&self, proc: ProcInfo, desktop: Option<DesktopEntry>) -> ActorInfo {
        let confidence = if desktop.is_some() {
            Confidence::Desktop
        } else if !proc.exe.is_empty() {
            Confidence::ExeOnly
        } else if !proc.name.is_empty() {
            Confidence::NameOnly
        } else {
            Confidence::Unknown
        };

        let (display_name, icon_name) = if let Some(entry) = &desktop {
            (entry.name.clone(), entry.icon.clone())
        } else if !proc.exe.is_empty() {
            (
                basename(&proc.exe).to_owned(),
                stem(&proc.exe).to_lowercase(),
            )
        } else if !proc.name.is_empty() {
            (proc.name.clone(), proc.name.to_lowercase())
        } else {
            ("Unknown".to_owned(), String::new())
        };

        let fallback_letter = display_name
            .chars()
            .next()
            .map(|c| c.to_uppercase().to_string())
            .unwrap_or_default();

        let fallback_key = desktop
            .as_ref()
            .map(|entry| entry.desktop_id.clone())
            .unwrap_or_else(|| display_name.to_lowercase());

        ActorInfo {
            proc,
            desktop,
            display_name,
            icon_name,
            fallback_letter,
            fallback_key,
            confidence,
        }
    }
}

impl Default for RequestorResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Strips trailing whitespace and a trailing ASCII or fullwidth colon.
#[must_use]
pub fn normalize_prompt(prompt: &str) -> String {
    let trimmed = prompt.trim();
    let stripped = trimmed
        .strip_suffix(':')
        .or_else(|| trimmed.strip_suffix('\u{FF1A}'))
        .unwrap_or(trimmed);
    stripped.trim_end().to_owned()
}
