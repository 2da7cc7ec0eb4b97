use std::path::{Component, Path, PathBuf};

use crate::config::RuntimeConfig;

/// Programs refused regardless of configuration.
pub const DENIED_PROGRAMS: &[&str] = &["shutdown", "reboot", "poweroff", "halt", "init"];

/// Separators that start a new command inside one shell line.
const COMMAND_SEPARATORS: &[&str] = &["&&", "||", ";", "|", "&", "\n", "\r", "$(", "`", "(", ")", "{", "}"];

/// Prefixes that run the next word as the actual program.
const COMMAND_WRAPPERS: &[&str] = &["sudo", "doas", "env", "command", "exec", "nohup", "nice", "time", "xargs"];

/// Shell constructs that can smuggle a write past a read-only check.
pub const DANGEROUS_PATTERNS: &[&str] = &[
    "<(", "$(", "`", ">", "&&", "||", "&", ";", "\n", "\r", "IFS",
];

/// Commands with no side effects.
pub const READONLY_COMMANDS: &[&str] = &[
    "ls", "cat", "echo", "pwd", "which", "head", "tail", "find", "grep", "rg", "wc", "stat",
    "file", "diff", "sort", "uniq", "tr", "cut", "awk", "env", "printenv", "uname", "whoami",
    "id", "date", "df", "du", "free", "uptime", "hostname", "realpath", "dirname", "basename",
    "readlink", "sha256sum", "jq", "yq",
];

/// Git subcommands that never mutate the repository.
pub const READONLY_GIT_SUBCOMMANDS: &[&str] = &[
    "status", "diff", "log", "show", "blame", "describe", "branch", "tag", "remote",
    "rev-parse", "ls-files", "ls-tree", "cat-file", "config", "stash", "grep",
];

/// `kubectl`/`helm` verbs that only read cluster state.
pub const READONLY_CLUSTER_VERBS: &[&str] = &[
    "get", "describe", "logs", "top", "version", "api-resources", "api-versions", "explain",
    "list", "status", "show", "search", "history", "cluster-info",
];

/// Match a command against a pattern that may contain `*` wildcards.
/// `kubectl get *` matches `kubectl get pods -A`.
pub fn matches_wildcard(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }
    let mut remaining = name;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !remaining.starts_with(part) {
                return false;
            }
            remaining = &remaining[part.len()..];
        } else if i == parts.len() - 1 {
            return remaining.ends_with(part);
        } else {
            match remaining.find(part) {
                Some(pos) => remaining = &remaining[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

pub fn any_pattern_matches(patterns: &[String], name: &str) -> bool {
    patterns.iter().any(|p| matches_wildcard(p, name))
}

/// Names the destructive construct in `command`, if any. Every command in
/// the line is checked on its parsed argv, so flag order and spelling
/// (`rm -fr`, `rm -r -f`, `/bin/rm --recursive --force`) do not matter.
pub fn matched_denied_pattern(command: &str) -> Option<&'static str> {
    let compact = command.split_whitespace().collect::<String>();
    if compact.contains(":(){") {
        return Some("fork bomb");
    }

    let mut spaced = command.to_string();
    for separator in COMMAND_SEPARATORS {
        spaced = spaced.replace(separator, " ; ");
    }
    let words = shlex::split(&spaced)
        .unwrap_or_else(|| spaced.split_whitespace().map(str::to_string).collect());

    words
        .split(|w| w == ";")
        .find_map(denied_segment)
}

fn denied_segment(segment: &[String]) -> Option<&'static str> {
    let mut args = segment
        .iter()
        .map(String::as_str)
        .skip_while(|w| COMMAND_WRAPPERS.contains(w) || w.starts_with('-') || is_env_assignment(w));
    let program = args.next()?;
    let program = program.rsplit('/').next().unwrap_or(program);
    let args = args.collect::<Vec<_>>();

    match program {
        "rm" => {
            let recursive = args.iter().any(|a| has_flag(a, 'r') || has_flag(a, 'R') || *a == "--recursive");
            let force = args.iter().any(|a| has_flag(a, 'f') || *a == "--force");
            (recursive && force).then_some("rm -rf")
        }
        "dd" => args.iter().any(|a| a.starts_with("if=")).then_some("dd if="),
        p if p == "mkfs" || p.starts_with("mkfs.") => Some("mkfs"),
        p => DENIED_PROGRAMS.iter().copied().find(|denied| *denied == p),
    }
}

/// `-rf` style short-flag clusters. Long options never match.
fn has_flag(arg: &str, flag: char) -> bool {
    arg.strip_prefix('-')
        .is_some_and(|rest| !rest.starts_with('-') && rest.contains(flag))
}

fn is_env_assignment(word: &str) -> bool {
    word.split_once('=')
        .is_some_and(|(name, _)| !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

pub fn is_read_only_command(command: &str) -> bool {
    let trimmed = command.trim();
    if trimmed.is_empty() || trimmed.contains('\n') || trimmed.contains('\r') {
        return false;
    }

    // Unparseable input is treated as unsafe.
    let Some(args) = shlex::split(trimmed) else {
        return false;
    };

    if args
        .iter()
        .any(|a| DANGEROUS_PATTERNS.iter().any(|p| a.contains(p)))
    {
        return false;
    }

    let mut current: Vec<&str> = Vec::new();
    let mut commands: Vec<Vec<&str>> = Vec::new();
    for arg in &args {
        if arg == "|" {
            if !current.is_empty() {
                commands.push(current);
            }
            current = Vec::new();
        } else if arg.contains('|') {
            return false;
        } else {
            current.push(arg);
        }
    }
    if !current.is_empty() {
        commands.push(current);
    }

    commands.iter().all(|cmd_args| is_read_only_segment(cmd_args))
}

fn is_read_only_segment(cmd_args: &[&str]) -> bool {
    let Some(cmd) = cmd_args.first() else {
        return false;
    };

    match *cmd {
        "find" => !cmd_args.iter().any(|a| {
            a.contains("-exec") || a.contains("-delete") || a.contains("-ok") || a.contains("-fprint")
        }),
        "grep" => !cmd_args.iter().any(|a| *a == "-P" || *a == "--perl-regexp"),
        "git" => match cmd_args.get(1) {
            Some(&"stash") => matches!(cmd_args.get(2).copied().unwrap_or("list"), "list" | "show"),
            Some(&"config") => !cmd_args.iter().any(|a| {
                a.starts_with("--set")
                    || a.starts_with("--unset")
                    || a.starts_with("--add")
                    || a.starts_with("--remove")
                    || a.starts_with("--replace")
            }),
            Some(sub) => READONLY_GIT_SUBCOMMANDS.contains(sub),
            None => false,
        },
        "kubectl" | "helm" => cmd_args
            .iter()
            .skip(1)
            .find(|a| !a.starts_with('-'))
            .is_some_and(|verb| READONLY_CLUSTER_VERBS.contains(verb)),
        other => READONLY_COMMANDS.contains(&other),
    }
}

/// Lexically resolves `.` and `..` without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyVerdict {
    pub read_only: bool,
}

/// Gate between an agent's tool request and the executor. Decisions depend
/// only on the command text and working directory, never on model output
/// beyond those two values.
#[derive(Debug, Clone, Default)]
pub struct CommandPolicy {
    allow: Vec<String>,
    deny: Vec<String>,
    allowed_roots: Vec<PathBuf>,
}

impl CommandPolicy {
    pub fn new(allow: Vec<String>, deny: Vec<String>, allowed_roots: Vec<PathBuf>) -> Self {
        Self {
            allow: allow
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            deny: deny
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            allowed_roots: allowed_roots.iter().map(|r| normalize_path(r)).collect(),
        }
    }

    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self::new(
            cfg.allow_commands.clone(),
            cfg.deny_commands.clone(),
            cfg.allowed_workdirs.iter().map(PathBuf::from).collect(),
        )
    }

    /// Deny wins over allow. An empty allow list admits every command that is
    /// not denied.
    pub fn check(&self, command: &str, cwd: &Path) -> Result<PolicyVerdict, String> {
        let command = command.trim();
        if command.is_empty() {
            return Err("empty command".to_string());
        }

        if let Some(pattern) = matched_denied_pattern(command) {
            return Err(format!("blocked pattern '{pattern}'"));
        }

        if any_pattern_matches(&self.deny, command) {
            return Err("matched a deny_commands pattern".to_string());
        }

        if !self.allow.is_empty() && !any_pattern_matches(&self.allow, command) {
            return Err("no allow_commands pattern matched".to_string());
        }

        if !self.allowed_roots.is_empty() {
            let cwd = normalize_path(cwd);
            if !self.allowed_roots.iter().any(|root| cwd.starts_with(root)) {
                return Err(format!(
                    "working directory '{}' is outside allowed_workdirs",
                    cwd.display()
                ));
            }
        }

        Ok(PolicyVerdict {
            read_only: is_read_only_command(command),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matching_handles_prefix_infix_and_suffix() {
        assert!(matches_wildcard("kubectl get *", "kubectl get pods -A"));
        assert!(matches_wildcard("*--dry-run", "helm upgrade x --dry-run"));
        assert!(matches_wildcard("git * --stat", "git log -3 --stat"));
        assert!(!matches_wildcard("kubectl get *", "kubectl delete pod x"));
        assert!(matches_wildcard("ls", "ls"));
        assert!(!matches_wildcard("ls", "ls -la"));
    }

    #[test]
    fn read_only_classification() {
        assert!(is_read_only_command("ls -la | grep foo"));
        assert!(is_read_only_command("git log --oneline"));
        assert!(is_read_only_command("kubectl get pods -n ops"));
        assert!(!is_read_only_command("kubectl delete pod x"));
        assert!(!is_read_only_command("echo hi > out.txt"));
        assert!(!is_read_only_command("find . -delete"));
        assert!(!is_read_only_command("git push origin main"));
        assert!(!is_read_only_command("ls; rm x"));
    }

    #[test]
    fn deny_takes_precedence_over_allow() {
        let policy = CommandPolicy::new(
            vec!["kubectl *".to_string()],
            vec!["kubectl delete *".to_string()],
            vec![],
        );
        let cwd = Path::new("/tmp");
        assert!(policy.check("kubectl get pods", cwd).is_ok());
        assert!(policy.check("kubectl delete pod x", cwd).is_err());
        assert!(policy.check("ls", cwd).is_err());
    }

    #[test]
    fn builtin_denied_patterns_always_apply() {
        let policy = CommandPolicy::default();
        let err = policy.check("rm -rf /", Path::new("/")).unwrap_err();
        assert!(err.contains("rm -rf"));
    }

    #[test]
    fn destructive_commands_are_caught_in_any_spelling() {
        for command in [
            "rm -fr /var/lib/data",
            "rm -r -f build",
            "/bin/rm --recursive --force cache",
            "sudo rm -Rf /opt/app",
            "ls && rm -fr /tmp/x",
            "cd /srv; FORCE=1 rm -rvf logs",
            "dd if=/dev/zero of=/dev/sda",
            "mkfs.ext4 /dev/sdb1",
            "sudo -n reboot",
            ":(){ :|:& };:",
        ] {
            assert!(matched_denied_pattern(command).is_some(), "{command} was not denied");
        }
        for command in ["rm -r build", "rm -f stale.lock", "echo rm -rf", "grep -rf patterns.txt ."] {
            assert!(matched_denied_pattern(command).is_none(), "{command} was denied");
        }
    }

    #[test]
    fn workdir_scoping_is_lexical() {
        let policy = CommandPolicy::new(vec![], vec![], vec![PathBuf::from("/srv/repo")]);
        assert!(policy.check("ls", Path::new("/srv/repo/sub")).is_ok());
        assert!(policy.check("ls", Path::new("/srv/repo/../other")).is_err());
        assert!(policy.check("ls", Path::new("/etc")).is_err());
    }
}
