//! sshd_config rendering and in-place directive rewriting.
//!
//! The private user-mode daemon gets a freshly rendered file. The system
//! daemons (root and Windows modes) keep their existing file, with only the
//! managed directives rewritten by [`set_directive`] and an optional marked
//! forced-directory block maintained by [`apply_forced_directory`].
//!
//! Both rewrites are idempotent: applying them twice yields the same file.

use std::path::{Path, PathBuf};

/// Opening marker of the managed forced-directory block
pub const FORCED_DIR_BEGIN: &str = "# BEGIN ci-sshd-relay default directory";

/// Closing marker of the managed forced-directory block
pub const FORCED_DIR_END: &str = "# END ci-sshd-relay default directory";

/// Inputs for the private daemon's config file
#[derive(Debug, Clone)]
pub struct UserConfig {
    pub port: u16,
    pub listen_address: String,
    pub host_keys: Vec<PathBuf>,
    pub pid_file: PathBuf,
    pub authorized_keys: PathBuf,
    pub allowed_users: Vec<String>,
    pub default_workdir: Option<PathBuf>,
}

/// Render the complete config of a private, unprivileged daemon.
pub fn render_user_config(config: &UserConfig) -> String {
    let mut out = String::from("# Generated by ci-sshd-relay; rewritten on every run\n");
    out.push_str(&format!("Port {}\n", config.port));
    out.push_str(&format!("ListenAddress {}\n", config.listen_address));
    for key in &config.host_keys {
        out.push_str(&format!("HostKey {}\n", key.display()));
    }
    out.push_str(&format!("PidFile {}\n", config.pid_file.display()));
    out.push_str(&format!(
        "AuthorizedKeysFile {}\n",
        config.authorized_keys.display()
    ));
    if !config.allowed_users.is_empty() {
        out.push_str(&format!("AllowUsers {}\n", config.allowed_users.join(" ")));
    }
    out.push_str(
        "PubkeyAuthentication yes\n\
         PasswordAuthentication no\n\
         KbdInteractiveAuthentication no\n\
         PermitRootLogin prohibit-password\n\
         UsePAM no\n\
         StrictModes no\n\
         PrintMotd no\n\
         LogLevel VERBOSE\n\
         Subsystem sftp internal-sftp\n",
    );
    if let Some(dir) = &config.default_workdir {
        out.push('\n');
        out.push_str(&forced_directory_block(&unix_force_command(dir)));
    }
    out
}

/// Directives the system daemons are rewritten with, in application order.
pub fn managed_directives(port: u16, allowed_users: &[String]) -> Vec<(&'static str, String)> {
    let mut directives = vec![
        ("Port", port.to_string()),
        ("PubkeyAuthentication", "yes".to_string()),
        ("PasswordAuthentication", "no".to_string()),
        ("KbdInteractiveAuthentication", "no".to_string()),
        ("PermitRootLogin", "prohibit-password".to_string()),
    ];
    if !allowed_users.is_empty() {
        directives.push(("AllowUsers", allowed_users.join(" ")));
    }
    directives
}

/// Rewrite an existing system config with the managed directives and the
/// optional forced-directory command.
pub fn rewrite_system_config(
    original: &str,
    directives: &[(&'static str, String)],
    force_command: Option<&str>,
) -> String {
    let mut config = original.to_string();
    for (key, value) in directives {
        config = set_directive(&config, key, value);
    }
    apply_forced_directory(&config, force_command)
}

fn is_match_line(line: &str) -> bool {
    first_word(line.trim()).eq_ignore_ascii_case("match")
}

fn is_include_line(line: &str) -> bool {
    first_word(line.trim()).eq_ignore_ascii_case("include")
}

fn first_word(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or_default()
}

/// Active `Key value` line
fn is_active(line: &str, key: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.starts_with('#') && first_word(trimmed).eq_ignore_ascii_case(key)
}

/// Commented-out default in OpenSSH's `#Key value` style
fn is_commented(line: &str, key: &str) -> bool {
    line.trim()
        .strip_prefix('#')
        .is_some_and(|rest| !rest.starts_with(char::is_whitespace) && first_word(rest).eq_ignore_ascii_case(key))
}

/// Set `key` to `value` in the global section of an sshd_config.
///
/// sshd keeps the first value it reads for most keywords, and a global
/// `Include` pulls drop-in files in at that point. So:
///
/// - The first active occurrence in the global section is replaced; if there
///   is none, the first commented `#Key` default is. Only occurrences ahead
///   of the first `Include` qualify.
/// - Otherwise the directive is inserted before the first `Include`, else
///   before the first `Match` line, else appended.
/// - Every other active occurrence in the global section is dropped.
///
/// Lines inside `Match` blocks are never touched.
pub fn set_directive(config: &str, key: &str, value: &str) -> String {
    let lines: Vec<&str> = config.lines().collect();
    let global_end = lines
        .iter()
        .position(|line| is_match_line(line) || line.trim() == FORCED_DIR_BEGIN)
        .unwrap_or(lines.len());
    let first_include = lines[..global_end].iter().position(|line| is_include_line(line));
    let settled_end = first_include.unwrap_or(global_end);
    let replacement = format!("{} {}", key, value);

    let target = lines[..settled_end]
        .iter()
        .position(|line| is_active(line, key))
        .or_else(|| lines[..settled_end].iter().position(|line| is_commented(line, key)));

    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 1);
    for (i, line) in lines.iter().enumerate() {
        if i == settled_end && target.is_none() {
            out.push(replacement.clone());
        }
        if i < global_end {
            if Some(i) == target {
                out.push(replacement.clone());
                continue;
            }
            if is_active(line, key) {
                continue;
            }
        }
        out.push(line.to_string());
    }
    if target.is_none() && settled_end == lines.len() {
        out.push(replacement);
    }

    let mut rendered = out.join("\n");
    rendered.push('\n');
    rendered
}

/// Wrap a `ForceCommand` in the managed `Match all` block.
pub fn forced_directory_block(force_command: &str) -> String {
    format!(
        "{}\nMatch all\n    ForceCommand {}\n{}\n",
        FORCED_DIR_BEGIN, force_command, FORCED_DIR_END
    )
}

/// Replace any managed block in `config` with one for `force_command`, or
/// remove it when `None`.
///
/// The block always goes last since a `Match` block extends to end of file.
pub fn apply_forced_directory(config: &str, force_command: Option<&str>) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut in_block = false;
    for line in config.lines() {
        match line.trim() {
            FORCED_DIR_BEGIN => in_block = true,
            FORCED_DIR_END => in_block = false,
            _ if !in_block => kept.push(line),
            _ => {}
        }
    }
    while kept.last().is_some_and(|l| l.trim().is_empty()) {
        kept.pop();
    }

    let mut out = kept.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    if let Some(command) = force_command {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&forced_directory_block(command));
    }
    out
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// POSIX command: enter `dir`, then run the requested command or a login shell.
pub fn unix_force_command(dir: &Path) -> String {
    format!(
        r#"cd {} && if [ -n "$SSH_ORIGINAL_COMMAND" ]; then exec /bin/sh -c "$SSH_ORIGINAL_COMMAND"; else exec "${{SHELL:-/bin/sh}}" -l; fi"#,
        shell_quote(&dir.to_string_lossy())
    )
}

/// cmd.exe variant of [`unix_force_command`].
pub fn windows_force_command(dir: &Path) -> String {
    format!(
        r#"cmd.exe /d /c "cd /d "{}" && if defined SSH_ORIGINAL_COMMAND (%SSH_ORIGINAL_COMMAND%) else (powershell.exe -NoLogo)""#,
        dir.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const STOCK: &str = "\
# This is the sshd server system-wide configuration file.
Include /etc/ssh/sshd_config.d/*.conf

#Port 22
#ListenAddress 0.0.0.0
#PermitRootLogin prohibit-password
PasswordAuthentication yes
KbdInteractiveAuthentication no
UsePAM yes

Subsystem\tsftp\t/usr/lib/openssh/sftp-server

Match User anoncvs
\tPasswordAuthentication yes
\tX11Forwarding no
";

    mod set_directive_rules {
        use super::*;

        #[test]
        fn test_replaces_commented_default() {
            let config = "#Port 22\n#ListenAddress 0.0.0.0\nUsePAM yes\n";
            let out = set_directive(config, "Port", "2222");
            assert_eq!(out, "Port 2222\n#ListenAddress 0.0.0.0\nUsePAM yes\n");
        }

        #[test]
        fn test_replaces_active_and_leaves_match_block() {
            let out = set_directive(STOCK, "PasswordAuthentication", "no");
            assert!(out.contains("\nPasswordAuthentication no\n"));
            assert!(!out.contains("\nPasswordAuthentication yes\n"));
            assert!(out.contains("\tPasswordAuthentication yes\n"));
        }

        #[test]
        fn test_absent_directive_inserted_before_match() {
            let config = "UsePAM yes\n\nMatch User anoncvs\n\tX11Forwarding no\n";
            let out = set_directive(config, "AllowUsers", "runner");
            assert_eq!(
                out,
                "UsePAM yes\n\nAllowUsers runner\nMatch User anoncvs\n\tX11Forwarding no\n"
            );
        }

        #[test]
        fn test_directives_precede_include_drop_ins() {
            for key in ["Port", "PasswordAuthentication", "AllowUsers"] {
                let out = set_directive(STOCK, key, "x");
                let lines: Vec<&str> = out.lines().collect();
                let set = lines.iter().position(|l| *l == format!("{} x", key)).unwrap();
                let include = lines.iter().position(|l| l.starts_with("Include")).unwrap();
                assert_eq!(set + 1, include, "{} placed after Include", key);
                assert_eq!(out.matches(&format!("\n{} ", key)).count(), 1);
            }
            // The commented default after the Include stays as documentation
            assert!(set_directive(STOCK, "Port", "2222").contains("\n#Port 22\n"));
        }

        #[test]
        fn test_directive_ahead_of_include_replaced_in_place() {
            let config = "Port 22\nInclude /etc/ssh/sshd_config.d/*.conf\nPort 2200\n";
            assert_eq!(
                set_directive(config, "Port", "2222"),
                "Port 2222\nInclude /etc/ssh/sshd_config.d/*.conf\n"
            );
        }

        #[test]
        fn test_absent_directive_appended_without_match() {
            let out = set_directive("UsePAM yes\n", "Port", "2222");
            assert_eq!(out, "UsePAM yes\nPort 2222\n");
            assert_eq!(set_directive("", "Port", "2222"), "Port 2222\n");
        }

        #[test]
        fn test_active_duplicates_collapse() {
            let config = "Port 22\nUsePAM yes\nport 2200\n";
            assert_eq!(set_directive(config, "Port", "2222"), "Port 2222\nUsePAM yes\n");
        }

        #[test]
        fn test_active_wins_over_comment() {
            let config = "#Port 22\nPort 2200\n";
            assert_eq!(set_directive(config, "Port", "2222"), "#Port 22\nPort 2222\n");
        }

        #[test]
        fn test_prose_comments_are_not_directives() {
            let config = "# Port forwarding is configured below\nUsePAM yes\n";
            let out = set_directive(config, "Port", "2222");
            assert_eq!(out, "# Port forwarding is configured below\nUsePAM yes\nPort 2222\n");
        }

        #[test]
        fn test_idempotent() {
            let once = set_directive(STOCK, "PermitRootLogin", "no");
            let twice = set_directive(&once, "PermitRootLogin", "no");
            assert_eq!(once, twice);
        }

        #[test]
        fn test_does_not_match_prefix_keys() {
            let config = "PortForwarding yes\n";
            assert_eq!(set_directive(config, "Port", "1"), "PortForwarding yes\nPort 1\n");
        }
    }

    mod forced_directory {
        use super::*;

        #[test]
        fn test_block_appended_and_replaced() {
            let first = apply_forced_directory("Port 22\n", Some("cd /a"));
            assert!(first.starts_with("Port 22\n\n# BEGIN"));
            assert!(first.contains("Match all\n    ForceCommand cd /a\n"));

            let second = apply_forced_directory(&first, Some("cd /b"));
            assert_eq!(second.matches(FORCED_DIR_BEGIN).count(), 1);
            assert!(second.contains("ForceCommand cd /b"));
            assert!(!second.contains("cd /a"));
        }

        #[test]
        fn test_block_removed_when_unset() {
            let with_block = apply_forced_directory("Port 22\n", Some("cd /a"));
            assert_eq!(apply_forced_directory(&with_block, None), "Port 22\n");
        }

        #[test]
        fn test_idempotent() {
            let once = apply_forced_directory(STOCK, Some("cd /w"));
            assert_eq!(apply_forced_directory(&once, Some("cd /w")), once);
        }

        #[test]
        fn test_unix_command_quotes_directory() {
            let cmd = unix_force_command(Path::new("/home/runner/it's here"));
            assert!(cmd.starts_with(r"cd '/home/runner/it'\''s here' && "));
            assert!(cmd.contains(r#"exec /bin/sh -c "$SSH_ORIGINAL_COMMAND""#));
            assert!(cmd.ends_with(r#"exec "${SHELL:-/bin/sh}" -l; fi"#));
        }
    }

    mod system_rewrite {
        use super::*;

        #[test]
        fn test_managed_directives_include_allow_list() {
            let directives = managed_directives(2222, &["runner".to_string(), "ci".to_string()]);
            assert_eq!(directives[0], ("Port", "2222".to_string()));
            assert!(directives.contains(&("AllowUsers", "runner ci".to_string())));
            assert!(managed_directives(22, &[]).iter().all(|(k, _)| *k != "AllowUsers"));
        }

        #[test]
        fn test_rewrite_is_idempotent() {
            let directives = managed_directives(2222, &["runner".to_string()]);
            let once = rewrite_system_config(STOCK, &directives, Some("cd /w"));
            let twice = rewrite_system_config(&once, &directives, Some("cd /w"));
            assert_eq!(once, twice);
            assert_eq!(once.matches("Port 2222").count(), 1);
            assert!(once.trim_end().ends_with(FORCED_DIR_END));
        }

        #[test]
        fn test_new_directive_lands_outside_marked_block() {
            let config = apply_forced_directory("Port 22\n", Some("cd /w"));
            let rewritten =
                rewrite_system_config(&config, &[("AllowUsers", "runner".to_string())], Some("cd /w"));

            let lines: Vec<&str> = rewritten.lines().collect();
            let allow = lines.iter().position(|l| *l == "AllowUsers runner").unwrap();
            let begin = lines.iter().position(|l| *l == FORCED_DIR_BEGIN).unwrap();
            assert!(allow < begin);
        }
    }

    mod user_config {
        use super::*;

        fn config(workdir: Option<&str>) -> UserConfig {
            UserConfig {
                port: 2222,
                listen_address: "0.0.0.0".to_string(),
                host_keys: vec![
                    PathBuf::from("/state/sshd/ssh_host_ed25519_key"),
                    PathBuf::from("/state/sshd/ssh_host_rsa_key"),
                ],
                pid_file: PathBuf::from("/state/sshd/sshd.pid"),
                authorized_keys: PathBuf::from("/state/sshd/authorized_keys"),
                allowed_users: vec!["runner".to_string()],
                default_workdir: workdir.map(PathBuf::from),
            }
        }

        #[test]
        fn test_substitutes_all_values() {
            let rendered = render_user_config(&config(None));
            for expected in [
                "Port 2222",
                "ListenAddress 0.0.0.0",
                "HostKey /state/sshd/ssh_host_ed25519_key",
                "HostKey /state/sshd/ssh_host_rsa_key",
                "PidFile /state/sshd/sshd.pid",
                "AuthorizedKeysFile /state/sshd/authorized_keys",
                "AllowUsers runner",
                "PasswordAuthentication no",
            ] {
                assert!(rendered.lines().any(|l| l == expected), "missing {}", expected);
            }
            assert!(!rendered.contains("Match"));
        }

        #[test]
        fn test_forced_directory_block() {
            let rendered = render_user_config(&config(Some("/work")));
            assert!(rendered.contains(FORCED_DIR_BEGIN));
            assert!(rendered.contains("ForceCommand cd '/work' && "));
        }
    }
}
