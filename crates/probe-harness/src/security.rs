use std::iter::Peekable;
use std::str::Chars;
use std::sync::LazyLock;

use probe_core::config::RunnerConfig;
use regex::Regex;
use tracing::warn;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("empty command")]
    Empty,
    #[error("command `{0}` is not on the allow list")]
    NotAllowed(String),
    #[error("destructive command `{0}` is not permitted")]
    Destructive(String),
    #[error("dangerous pattern `{0}` detected")]
    DangerousPattern(String),
    #[error("`{0}` runs commands that cannot be checked")]
    Unverifiable(String),
    #[error("malformed command: {0}")]
    Malformed(String),
}

// ===========================================================================
// CommandPolicy
// ===========================================================================

static ENV_ASSIGNMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=").expect("static regex"));

const DESTRUCTIVE_VERBS: &[&str] = &[
    "rm", "rmdir", "dd", "mkfs", "shred", "sudo", "su", "doas", "chmod", "chown", "kill",
    "killall", "pkill", "shutdown", "reboot", "halt", "poweroff", "truncate",
];

const DANGEROUS_PATTERNS: &[&str] = &[
    "rm -rf",
    "chmod 777",
    "curl | sh",
    "wget | sh",
    "curl | bash",
    "> /dev/",
    ":(){",
];

const SHELLS: &[&str] = &["sh", "bash", "zsh", "dash", "ksh"];

/// `find` primaries that delete files or run other programs.
const FIND_ACTIONS: &[&str] = &["-delete", "-exec", "-execdir", "-ok", "-okdir"];

/// Substitutions and wrappers may nest; anything deeper is refused.
const MAX_NESTING: usize = 8;

/// Decides which shell commands the command tool may run.
///
/// Every command position in the line (after `&&`, `||`, `;`, `|`, and
/// inside `$(...)` or backticks) must name an allowed verb or the product
/// CLI. Operators inside quotes are plain text. Destructive verbs are
/// refused even if allow-listed, and so is any command reached through a
/// wrapper such as `env`, `timeout`, `xargs` or `sh -c`.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    allowed: Vec<String>,
    product_cli: Option<String>,
}

impl CommandPolicy {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
            product_cli: None,
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        let policy = Self::new(config.allowed_commands.iter().cloned());
        match &config.product_cli {
            Some(cli) => policy.with_product_cli(cli.clone()),
            None => policy,
        }
    }

    /// Always allow the product's own binary.
    pub fn with_product_cli(mut self, cli: impl Into<String>) -> Self {
        self.product_cli = Some(cli.into());
        self
    }

    pub fn allowed_verbs(&self) -> impl Iterator<Item = &str> {
        self.allowed
            .iter()
            .map(String::as_str)
            .chain(self.product_cli.as_deref())
    }

    pub fn check(&self, command: &str) -> Result<(), PolicyError> {
        if command.trim().is_empty() {
            return Err(PolicyError::Empty);
        }

        let lowered = command.to_lowercase();
        if let Some(pattern) = DANGEROUS_PATTERNS.iter().find(|p| lowered.contains(*p)) {
            warn!(command, pattern, "dangerous pattern in command");
            return Err(PolicyError::DangerousPattern(pattern.to_string()));
        }

        self.check_line(command, 0)
            .inspect_err(|error| warn!(command, %error, "command rejected"))
    }

    fn check_line(&self, line: &str, depth: usize) -> Result<(), PolicyError> {
        if depth > MAX_NESTING {
            return Err(PolicyError::Malformed("commands nested too deeply".into()));
        }
        let parsed = parse(line)?;
        for body in &parsed.substitutions {
            self.check_line(body, depth + 1)?;
        }
        for words in &parsed.segments {
            self.check_words(words, depth)?;
        }
        Ok(())
    }

    /// Check one simple command, then whatever command it hands off to.
    fn check_words(&self, words: &[String], depth: usize) -> Result<(), PolicyError> {
        if depth > MAX_NESTING {
            return Err(PolicyError::Malformed("commands nested too deeply".into()));
        }
        let start = words
            .iter()
            .position(|w| !ENV_ASSIGNMENT.is_match(w))
            .unwrap_or(words.len());
        let Some((verb, args)) = words[start..].split_first() else {
            return Ok(());
        };

        let base = basename(verb);
        if DESTRUCTIVE_VERBS.contains(&base) {
            return Err(PolicyError::Destructive(base.to_string()));
        }
        if !self.is_allowed(verb) {
            return Err(PolicyError::NotAllowed(verb.to_string()));
        }

        match base {
            "find" => {
                if let Some(action) = args.iter().find(|a| FIND_ACTIONS.contains(&a.as_str())) {
                    return Err(PolicyError::Destructive(format!("find {action}")));
                }
            }
            "git" => check_git(args)?,
            "env" => {
                if let Some(script) = option_value(args, &["-S", "--split-string"]) {
                    self.check_line(script, depth + 1)?;
                }
            }
            shell if SHELLS.contains(&shell) => {
                return match shell_script(args) {
                    Some(script) => self.check_line(script, depth + 1),
                    None => Err(PolicyError::Unverifiable(shell.to_string())),
                };
            }
            _ => {}
        }

        match wrapped_command(base, args) {
            Some(inner) => self.check_words(inner, depth + 1),
            None => Ok(()),
        }
    }

    fn is_allowed(&self, verb: &str) -> bool {
        let base = basename(verb);
        if self.allowed.iter().any(|a| a == verb || a == base) {
            return true;
        }
        match &self.product_cli {
            Some(cli) => cli == verb || basename(cli) == base,
            None => false,
        }
    }
}

fn basename(verb: &str) -> &str {
    verb.rsplit('/').next().unwrap_or(verb)
}

/// `git clean` and history-discarding forms of `reset` and `push`.
fn check_git(args: &[String]) -> Result<(), PolicyError> {
    let mut i = 0;
    while let Some(arg) = args.get(i).filter(|a| a.starts_with('-')) {
        let takes_value = matches!(
            arg.as_str(),
            "-C" | "-c" | "--git-dir" | "--work-tree" | "--namespace"
        );
        i += if takes_value { 2 } else { 1 };
    }
    let Some(sub) = args.get(i) else {
        return Ok(());
    };
    let rest = &args[i + 1..];
    let has = |flag: &str| rest.iter().any(|a| a == flag);

    let refused = match sub.as_str() {
        "clean" => Some("git clean"),
        "reset" if has("--hard") => Some("git reset --hard"),
        "push" if has("--force") || has("-f") => Some("git push --force"),
        _ => None,
    };
    match refused {
        Some(form) => Err(PolicyError::Destructive(form.to_string())),
        None => Ok(()),
    }
}

/// Script passed to a shell with `-c` (or a flag cluster such as `-ec`).
fn shell_script(args: &[String]) -> Option<&str> {
    let flag = args
        .iter()
        .position(|a| a.starts_with('-') && !a.starts_with("--") && a.contains('c'))?;
    args.get(flag + 1).map(String::as_str)
}

fn option_value<'a>(args: &'a [String], names: &[&str]) -> Option<&'a str> {
    let pos = args.iter().position(|a| names.contains(&a.as_str()))?;
    args.get(pos + 1).map(String::as_str)
}

/// The command a wrapper such as `env` or `timeout` runs, if any.
fn wrapped_command<'a>(wrapper: &str, args: &'a [String]) -> Option<&'a [String]> {
    // Options that consume the next word, and positionals before the command.
    let (takes_value, mut positionals): (&[&str], usize) = match wrapper {
        "env" => (&["-u", "--unset", "-C", "--chdir", "-S", "--split-string"], 0),
        "nice" => (&["-n", "--adjustment"], 0),
        "timeout" => (&["-s", "--signal", "-k", "--kill-after"], 1),
        "xargs" => (
            &[
                "-I", "-n", "-P", "-d", "-L", "-s", "-E", "-a", "--arg-file", "--delimiter",
                "--max-args", "--max-procs", "--replace",
            ],
            0,
        ),
        "stdbuf" => (&["-i", "-o", "-e"], 0),
        "nohup" | "time" | "command" | "exec" | "setsid" | "ionice" => (&[], 0),
        _ => return None,
    };

    let mut i = 0;
    let mut options_done = false;
    while let Some(arg) = args.get(i).map(String::as_str) {
        if !options_done && arg == "--" {
            options_done = true;
            i += 1;
        } else if !options_done && arg.starts_with('-') && arg.len() > 1 {
            i += if takes_value.contains(&arg) { 2 } else { 1 };
        } else if wrapper == "env" && ENV_ASSIGNMENT.is_match(arg) {
            i += 1;
        } else if positionals > 0 {
            positionals -= 1;
            i += 1;
        } else {
            break;
        }
    }
    args.get(i..).filter(|rest| !rest.is_empty())
}

// ---------------------------------------------------------------------------
// Command line lexing
// ---------------------------------------------------------------------------

/// A command line split into simple commands.
#[derive(Debug, Default)]
struct Parsed {
    /// Words of each simple command, quotes removed.
    segments: Vec<Vec<String>>,
    /// Bodies of `$(...)` and backtick substitutions.
    substitutions: Vec<String>,
}

#[derive(Default)]
struct Segment {
    words: Vec<String>,
    word: String,
    in_word: bool,
}

impl Segment {
    fn push(&mut self, c: char) {
        self.word.push(c);
        self.in_word = true;
    }

    fn end_word(&mut self) {
        if self.in_word {
            self.words.push(std::mem::take(&mut self.word));
            self.in_word = false;
        }
    }

    fn finish(&mut self, out: &mut Vec<Vec<String>>) {
        self.end_word();
        if !self.words.is_empty() {
            out.push(std::mem::take(&mut self.words));
        }
    }
}

/// Split on unquoted control operators. Single quotes are literal; double
/// quotes still open substitutions.
fn parse(line: &str) -> Result<Parsed, PolicyError> {
    let mut parsed = Parsed::default();
    let mut seg = Segment::default();
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                seg.in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => seg.word.push(ch),
                        None => return Err(unterminated("'")),
                    }
                }
            }
            '"' => {
                seg.in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => {
                            if let Some(ch) = chars.next() {
                                seg.word.push(ch);
                            }
                        }
                        Some('$') if chars.peek() == Some(&'(') => {
                            chars.next();
                            parsed.substitutions.push(read_substitution(&mut chars)?);
                        }
                        Some('`') => parsed.substitutions.push(read_backtick(&mut chars)?),
                        Some(ch) => seg.word.push(ch),
                        None => return Err(unterminated("\"")),
                    }
                }
            }
            '\\' => {
                if let Some(ch) = chars.next() {
                    seg.push(ch);
                }
            }
            '$' if chars.peek() == Some(&'(') => {
                chars.next();
                seg.in_word = true;
                parsed.substitutions.push(read_substitution(&mut chars)?);
            }
            '`' => {
                seg.in_word = true;
                parsed.substitutions.push(read_backtick(&mut chars)?);
            }
            // `2>&1` and `&>` are redirections, not background operators.
            '&' if seg.word.ends_with(['>', '<']) || chars.peek() == Some(&'>') => seg.push(c),
            ';' | '&' | '|' | '\n' | '(' | ')' => seg.finish(&mut parsed.segments),
            c if c.is_whitespace() => seg.end_word(),
            c => seg.push(c),
        }
    }
    seg.finish(&mut parsed.segments);
    Ok(parsed)
}

/// Body of a `$(...)` whose opener was consumed.
fn read_substitution(chars: &mut Peekable<Chars<'_>>) -> Result<String, PolicyError> {
    let mut body = String::new();
    let mut depth = 1usize;
    let mut quote: Option<char> = None;
    for c in chars.by_ref() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth == 0 {
                    return Ok(body);
                }
            }
            _ => {}
        }
        body.push(c);
    }
    Err(unterminated("$("))
}

fn read_backtick(chars: &mut Peekable<Chars<'_>>) -> Result<String, PolicyError> {
    let mut body = String::new();
    for c in chars.by_ref() {
        if c == '`' {
            return Ok(body);
        }
        body.push(c);
    }
    Err(unterminated("`"))
}

fn unterminated(opener: &str) -> PolicyError {
    PolicyError::Malformed(format!("unterminated `{opener}`"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CommandPolicy {
        CommandPolicy::new(["ls", "cat", "grep", "echo", "cd"]).with_product_cli("./bin/acme")
    }

    fn defaults() -> CommandPolicy {
        CommandPolicy::from_config(&RunnerConfig::default())
    }

    fn with_wrappers() -> CommandPolicy {
        CommandPolicy::new(["ls", "echo", "env", "nice", "timeout", "xargs", "nohup", "sh", "bash"])
    }

    #[test]
    fn allows_whitelisted_pipeline() {
        assert!(policy().check("ls -la | grep foo && echo done").is_ok());
    }

    #[test]
    fn allows_product_cli_and_env_prefix() {
        let p = policy();
        assert!(p.check("./bin/acme init").is_ok());
        assert!(p.check("DEBUG=1 acme status").is_ok());
    }

    #[test]
    fn rejects_unknown_verb() {
        assert_eq!(
            policy().check("curl https://example.com"),
            Err(PolicyError::NotAllowed("curl".into()))
        );
    }

    #[test]
    fn rejects_destructive_even_when_chained() {
        assert_eq!(
            policy().check("ls; rm file.txt"),
            Err(PolicyError::Destructive("rm".into()))
        );
        assert_eq!(
            policy().check("echo $(/bin/rm x)"),
            Err(PolicyError::Destructive("rm".into()))
        );
        assert_eq!(
            policy().check("echo \"now `rm x`\""),
            Err(PolicyError::Destructive("rm".into()))
        );
    }

    #[test]
    fn destructive_verb_wins_over_allow_list() {
        let p = CommandPolicy::new(["rm"]);
        assert!(matches!(p.check("rm a"), Err(PolicyError::Destructive(_))));
    }

    #[test]
    fn rejects_dangerous_pattern() {
        assert!(matches!(
            policy().check("echo hi && RM -RF /"),
            Err(PolicyError::DangerousPattern(_))
        ));
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(policy().check("   "), Err(PolicyError::Empty));
    }

    #[test]
    fn wrapped_commands_are_checked() {
        let p = defaults();
        assert_eq!(
            p.check("env rm important.txt"),
            Err(PolicyError::Destructive("rm".into()))
        );
        assert_eq!(
            p.check("env -i PATH=/bin -u HOME rm x"),
            Err(PolicyError::Destructive("rm".into()))
        );
        assert!(matches!(p.check("env -S 'rm x'"), Err(PolicyError::Destructive(_))));

        let w = with_wrappers();
        for line in [
            "nice -n 5 rm x",
            "timeout 5 rm x",
            "timeout -s KILL 5s rm x",
            "ls | xargs rm",
            "ls | xargs -I{} rm {}",
            "nohup rm x",
            "sh -c 'rm x'",
            "bash -c \"ls && rm x\"",
            "bash -ec 'env rm x'",
        ] {
            assert_eq!(
                w.check(line),
                Err(PolicyError::Destructive("rm".into())),
                "{line}"
            );
        }
        assert_eq!(
            w.check("timeout 5 curl example.com"),
            Err(PolicyError::NotAllowed("curl".into()))
        );
    }

    #[test]
    fn wrappers_around_allowed_commands_pass() {
        assert!(defaults().check("env FOO=1 ls").is_ok());
        assert!(defaults().check("env").is_ok());
        let w = with_wrappers();
        assert!(w.check("timeout 10 ls -la").is_ok());
        assert!(w.check("ls | xargs echo").is_ok());
        assert_eq!(
            w.check("sh -c 'ls | grep x'"),
            Err(PolicyError::NotAllowed("grep".into()))
        );
        assert!(w.check("sh -c 'ls && echo ok'").is_ok());
    }

    #[test]
    fn shell_without_script_is_unverifiable() {
        assert_eq!(
            with_wrappers().check("echo rm x | sh"),
            Err(PolicyError::Unverifiable("sh".into()))
        );
    }

    #[test]
    fn find_actions_are_refused() {
        let p = defaults();
        assert_eq!(
            p.check("find . -delete"),
            Err(PolicyError::Destructive("find -delete".into()))
        );
        assert_eq!(
            p.check("find . -name '*.json' -exec rm {} +"),
            Err(PolicyError::Destructive("find -exec".into()))
        );
        assert!(matches!(
            p.check("find . -execdir cat {} ;"),
            Err(PolicyError::Destructive(_))
        ));
        assert!(p.check("find . -name '*.json' -type f").is_ok());
    }

    #[test]
    fn destructive_git_forms_are_refused() {
        let p = defaults();
        assert_eq!(
            p.check("git clean -fdx"),
            Err(PolicyError::Destructive("git clean".into()))
        );
        assert_eq!(
            p.check("git -C repo reset --hard HEAD~1"),
            Err(PolicyError::Destructive("git reset --hard".into()))
        );
        assert!(matches!(
            p.check("git push --force origin main"),
            Err(PolicyError::Destructive(_))
        ));
        assert!(p.check("git status && git log --oneline").is_ok());
        assert!(p.check("git reset --soft HEAD~1").is_ok());
    }

    #[test]
    fn quoted_operators_are_text() {
        let p = policy();
        assert!(p.check("echo \"a;b\"").is_ok());
        assert!(p.check("echo 'x && rm y' | grep rm").is_ok());
        assert!(p.check("grep -E 'foo|bar' notes.txt").is_ok());
        assert!(p.check("echo '$(rm x)'").is_ok());
        assert!(p.check("ls 2>&1 | grep x").is_ok());
    }

    #[test]
    fn unterminated_quote_is_malformed() {
        assert!(matches!(
            policy().check("echo \"abc"),
            Err(PolicyError::Malformed(_))
        ));
    }
}
