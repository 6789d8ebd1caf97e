//! Optional pre-spawn screening: a denylist scan over Python sources and a
//! zip-bomb check over archives in the work directory.
//!
//! The source scan tokenizes the file and skips comments and string
//! literals, so a denylisted name only trips when it appears as a real
//! call or import. The archive check walks the central directory without
//! expanding anything.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use tracing::debug;

/// What the executor screens before spawning.
#[derive(Debug, Clone, Default)]
pub struct SecurityPolicy {
    /// Scan `.py` sources for denylisted calls/imports.
    pub scan_sources: bool,
    /// Screen `.zip` archives for bomb signals.
    pub scan_archives: bool,
}

impl SecurityPolicy {
    /// Whether any screening is enabled.
    pub fn is_active(&self) -> bool {
        self.scan_sources || self.scan_archives
    }
}

/// Denylisted callables; matched only when directly invoked.
const DENYLISTED_CALLS: &[&str] = &[
    "os.system",
    "os.popen",
    "os.execv",
    "os.execve",
    "os.fork",
    "os.setuid",
    "subprocess.Popen",
    "subprocess.call",
    "subprocess.run",
    "subprocess.check_output",
    "shutil.rmtree",
    "eval",
    "exec",
    "compile",
    "__import__",
];

/// Denylisted modules; matched on `import x` / `from x import ...`.
const DENYLISTED_IMPORTS: &[&str] = &["ctypes"];

const ZIP_MAX_RATIO: f64 = 100.0;
const ZIP_MAX_FILES: u64 = 10_000;
const ZIP_MAX_EXPANDED: u64 = 2 * 1024 * 1024 * 1024;
const MAX_SCANNED_FILES: usize = 2000;
const MAX_SOURCE_BYTES: u64 = 1024 * 1024;

/// Screen `work_dir` under `policy`; an `Err` aborts the run.
pub fn screen_work_dir(work_dir: &Path, policy: &SecurityPolicy) -> anyhow::Result<()> {
    if policy.scan_sources {
        for path in collect_files(work_dir, "py")? {
            scan_source_file(&path)?;
        }
    }
    if policy.scan_archives {
        for path in collect_files(work_dir, "zip")? {
            scan_zip_archive(&path)?;
        }
    }
    Ok(())
}

fn collect_files(root: &Path, extension: &str) -> anyhow::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %dir.display(), "skipping unreadable directory: {err}");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some(extension) {
                found.push(path);
                if found.len() >= MAX_SCANNED_FILES {
                    return Ok(found);
                }
            }
        }
    }
    Ok(found)
}

/// Scan one Python source for denylisted usage.
pub fn scan_source_file(path: &Path) -> anyhow::Result<()> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?;
    if metadata.len() > MAX_SOURCE_BYTES {
        return Ok(());
    }
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    if let Some(pattern) = find_denylisted(&source) {
        bail!(
            "blocked pattern `{pattern}` in {}",
            path.display()
        );
    }
    Ok(())
}

/// Find the first denylisted call or import in `source`, ignoring comments
/// and string literals. Attribute paths match structurally, so whitespace
/// around the dots (`os . system`) does not evade the denylist.
pub fn find_denylisted(source: &str) -> Option<&'static str> {
    let tokens = tokenize(source);
    for (i, token) in tokens.iter().enumerate() {
        match token.as_str() {
            "import" | "from" => {
                if let Some(module) = tokens.get(i + 1) {
                    let root = module.split('.').next().unwrap_or(module);
                    if let Some(hit) = DENYLISTED_IMPORTS.iter().find(|m| **m == root) {
                        return Some(hit);
                    }
                }
            }
            name => {
                if tokens.get(i + 1).map(String::as_str) == Some("(") {
                    if let Some(hit) = DENYLISTED_CALLS.iter().find(|c| **c == name) {
                        return Some(hit);
                    }
                }
            }
        }
    }
    None
}

/// Split source into identifier-path tokens and `(` markers, skipping
/// comments and single/triple-quoted strings. Dotted attribute access that
/// the lexer split on whitespace is joined back into one path.
fn tokenize(source: &str) -> Vec<String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    let flush = |current: &mut String, tokens: &mut Vec<String>| {
        if !current.is_empty() {
            tokens.push(std::mem::take(current));
        }
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            '#' => {
                flush(&mut current, &mut tokens);
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '\'' | '"' => {
                flush(&mut current, &mut tokens);
                let quote = c;
                let triple = chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote);
                if triple {
                    i += 3;
                    while i + 2 < chars.len()
                        && !(chars[i] == quote && chars[i + 1] == quote && chars[i + 2] == quote)
                    {
                        i += 1;
                    }
                    i = (i + 3).min(chars.len());
                } else {
                    i += 1;
                    while i < chars.len() && chars[i] != quote && chars[i] != '\n' {
                        if chars[i] == '\\' {
                            i += 1;
                        }
                        i += 1;
                    }
                    i = (i + 1).min(chars.len());
                }
            }
            c if c.is_alphanumeric() || c == '_' || c == '.' => {
                current.push(c);
                i += 1;
            }
            '(' => {
                flush(&mut current, &mut tokens);
                tokens.push("(".to_string());
                i += 1;
            }
            _ => {
                flush(&mut current, &mut tokens);
                i += 1;
            }
        }
    }
    flush(&mut current, &mut tokens);

    // Re-join attribute access split by whitespace ("os . system" becomes
    // "os.system"). Bare `from`/`import` keywords never merge, keeping the
    // import checks intact for relative imports.
    let mut joined: Vec<String> = Vec::with_capacity(tokens.len());
    for token in tokens {
        if token != "(" {
            if let Some(prev) = joined.last_mut() {
                if prev != "("
                    && prev != "from"
                    && prev != "import"
                    && (prev.ends_with('.') || token.starts_with('.'))
                {
                    prev.push_str(&token);
                    continue;
                }
            }
        }
        joined.push(token);
    }
    joined
}

const EOCD_SIG: u64 = 0x0605_4b50;
const CENTRAL_SIG: u64 = 0x0201_4b50;

fn u16_at(buf: &[u8], offset: usize) -> u64 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]]) as u64
}

fn u32_at(buf: &[u8], offset: usize) -> u64 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]) as u64
}

/// Screen a zip archive by walking its central directory.
pub fn scan_zip_archive(path: &Path) -> anyhow::Result<()> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("open {}", path.display()))?;
    let file_len = file.metadata()?.len();

    // The end-of-central-directory record sits in the last 22..22+65535
    // bytes (trailing comment permitted).
    let tail_len = file_len.min(22 + 65_535);
    file.seek(SeekFrom::End(-(tail_len as i64)))?;
    let mut tail = vec![0_u8; tail_len as usize];
    file.read_exact(&mut tail)?;

    let eocd = (0..tail.len().saturating_sub(21))
        .rev()
        .find(|&i| u32_at(&tail, i) == EOCD_SIG)
        .with_context(|| format!("{}: no end-of-central-directory record", path.display()))?;

    let total_entries = u16_at(&tail, eocd + 10);
    let cd_size = u32_at(&tail, eocd + 12);
    let cd_offset = u32_at(&tail, eocd + 16);

    if total_entries > ZIP_MAX_FILES {
        bail!(
            "{}: {} entries exceeds the {} limit",
            path.display(),
            total_entries,
            ZIP_MAX_FILES
        );
    }

    file.seek(SeekFrom::Start(cd_offset))?;
    let mut directory = vec![0_u8; cd_size.min(file_len) as usize];
    file.read_exact(&mut directory)?;

    let mut compressed_total = 0_u64;
    let mut expanded_total = 0_u64;
    let mut entries = 0_u64;
    let mut offset = 0_usize;
    while offset + 46 <= directory.len() {
        if u32_at(&directory, offset) != CENTRAL_SIG {
            break;
        }
        compressed_total += u32_at(&directory, offset + 20);
        expanded_total += u32_at(&directory, offset + 24);
        entries += 1;
        let name_len = u16_at(&directory, offset + 28) as usize;
        let extra_len = u16_at(&directory, offset + 30) as usize;
        let comment_len = u16_at(&directory, offset + 32) as usize;
        offset += 46 + name_len + extra_len + comment_len;
    }

    if entries > ZIP_MAX_FILES {
        bail!(
            "{}: {} entries exceeds the {} limit",
            path.display(),
            entries,
            ZIP_MAX_FILES
        );
    }
    if expanded_total > ZIP_MAX_EXPANDED {
        bail!(
            "{}: expands to {} bytes, over the {} limit",
            path.display(),
            expanded_total,
            ZIP_MAX_EXPANDED
        );
    }
    if compressed_total > 0 {
        let ratio = expanded_total as f64 / compressed_total as f64;
        if ratio > ZIP_MAX_RATIO {
            bail!(
                "{}: compression ratio {ratio:.1} exceeds {ZIP_MAX_RATIO}",
                path.display()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn flags_denylisted_calls() {
        assert_eq!(
            find_denylisted("import os\nos.system('ls')\n"),
            Some("os.system")
        );
        assert_eq!(find_denylisted("x = eval ( '1+1' )"), Some("eval"));
        assert_eq!(
            find_denylisted("from subprocess import x\nsubprocess.run(['ls'])"),
            Some("subprocess.run")
        );
    }

    #[test]
    fn flags_denylisted_imports() {
        assert_eq!(find_denylisted("import ctypes\n"), Some("ctypes"));
        assert_eq!(
            find_denylisted("from ctypes.util import find_library\n"),
            Some("ctypes")
        );
    }

    #[test]
    fn spacing_around_dots_does_not_evade() {
        assert_eq!(find_denylisted("os . system('ls')"), Some("os.system"));
        assert_eq!(find_denylisted("os .system('ls')"), Some("os.system"));
        assert_eq!(find_denylisted("os. system('ls')"), Some("os.system"));
        assert_eq!(
            find_denylisted("subprocess\n    . run(['ls'])"),
            Some("subprocess.run")
        );
    }

    #[test]
    fn relative_imports_stay_unflagged() {
        assert_eq!(find_denylisted("from . import helpers\n"), None);
        assert_eq!(find_denylisted("from .utils import helper\n"), None);
    }

    #[test]
    fn ignores_comments_and_strings() {
        assert_eq!(find_denylisted("# os.system('ls')\nprint('hi')\n"), None);
        assert_eq!(find_denylisted("s = 'os.system(\"ls\")'\n"), None);
        assert_eq!(
            find_denylisted("doc = \"\"\"uses os.system( internally\"\"\"\n"),
            None
        );
        // A name alone, never called, does not trip.
        assert_eq!(find_denylisted("handler = os.system\n"), None);
    }

    #[test]
    fn clean_source_passes() {
        assert_eq!(
            find_denylisted("import json\n\ndef main():\n    print(json.dumps({}))\n"),
            None
        );
    }

    #[test]
    fn scan_source_file_reports_the_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("job.py");
        std::fs::write(&bad, "import os\nos.popen('id')\n").unwrap();
        let err = scan_source_file(&bad).unwrap_err().to_string();
        assert!(err.contains("os.popen"), "{err}");

        let good = dir.path().join("ok.py");
        std::fs::write(&good, "print('fine')\n").unwrap();
        assert!(scan_source_file(&good).is_ok());
    }

    /// Fabricate a central directory + EOCD with the given
    /// (compressed, expanded) sizes per entry.
    fn fake_zip(entries: &[(u32, u32)]) -> Vec<u8> {
        let mut cd = Vec::new();
        for (compressed, expanded) in entries {
            let mut header = vec![0_u8; 46];
            header[0..4].copy_from_slice(&0x0201_4b50_u32.to_le_bytes());
            header[20..24].copy_from_slice(&compressed.to_le_bytes());
            header[24..28].copy_from_slice(&expanded.to_le_bytes());
            header[28..30].copy_from_slice(&1_u16.to_le_bytes());
            header.push(b'a');
            cd.extend_from_slice(&header);
        }

        let mut out = cd.clone();
        let mut eocd = vec![0_u8; 22];
        eocd[0..4].copy_from_slice(&0x0605_4b50_u32.to_le_bytes());
        eocd[8..10].copy_from_slice(&(entries.len() as u16).to_le_bytes());
        eocd[10..12].copy_from_slice(&(entries.len() as u16).to_le_bytes());
        eocd[12..16].copy_from_slice(&(cd.len() as u32).to_le_bytes());
        eocd[16..20].copy_from_slice(&0_u32.to_le_bytes());
        out.extend_from_slice(&eocd);
        out
    }

    fn write_zip(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn sane_archive_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(dir.path(), "ok.zip", &fake_zip(&[(1000, 3000), (500, 500)]));
        assert!(scan_zip_archive(&path).is_ok());
    }

    #[test]
    fn extreme_ratio_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(dir.path(), "bomb.zip", &fake_zip(&[(100, 1_000_000)]));
        let err = scan_zip_archive(&path).unwrap_err().to_string();
        assert!(err.contains("ratio"), "{err}");
    }

    #[test]
    fn oversized_expansion_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        // Two entries summing past 2 GiB, each with a believable ratio.
        let path = write_zip(
            dir.path(),
            "big.zip",
            &fake_zip(&[(2_000_000_000, 2_000_000_000), (200_000_000, 200_000_000)]),
        );
        let err = scan_zip_archive(&path).unwrap_err().to_string();
        assert!(err.contains("expands"), "{err}");
    }

    #[test]
    fn screening_respects_policy_flags() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("job.py"), "eval('1')\n").unwrap();

        let off = SecurityPolicy::default();
        assert!(screen_work_dir(dir.path(), &off).is_ok());

        let on = SecurityPolicy {
            scan_sources: true,
            scan_archives: false,
        };
        assert!(screen_work_dir(dir.path(), &on).is_err());
    }
}
