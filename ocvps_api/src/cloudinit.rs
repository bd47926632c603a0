//! Cloud-init user-data assembly.
//!
//! Produces the single `#cloud-config` document written as a snippet and
//! referenced from the VM's `cicustom`. Networking is always disabled
//! inside cloud-init because Proxmox's `ipconfig0` owns the guest
//! network config.
//!
//! Three system files ride along in every document: an sshd drop-in that
//! accepts the proxy's forwarded client variables, a PAM hook, and the
//! lastlog helper script the hook runs. User-supplied files at the same
//! paths are merged, not replaced.

use ocvps_db::ImageKind;
use serde::Deserialize;

pub const SSHD_SNIPPET_PATH: &str = "/etc/ssh/sshd_config.d/99-obiente-cloud.conf";
pub const PAM_SSHD_PATH: &str = "/etc/pam.d/sshd";
pub const LASTLOG_SCRIPT_PATH: &str = "/usr/local/bin/obiente-update-lastlog.sh";

const ACCEPT_ENV_LINE: &str = "AcceptEnv SSH_CLIENT SSH_CONNECTION SSH_CLIENT_REAL";
const PAM_HOOK_LINE: &str =
    "session    optional     pam_exec.so seteuid /usr/local/bin/obiente-update-lastlog.sh";
const PAM_LASTLOG_LINE: &str = "session    optional     pam_lastlog.so silent";

const LASTLOG_SCRIPT: &str = r#"#!/bin/sh
# Record the real client address (as forwarded by the SSH proxy) into
# /var/log/lastlog at session open.
[ "$PAM_TYPE" = "open_session" ] || exit 0
REAL="${SSH_CLIENT_REAL:-$SSH_CLIENT}"
[ -n "$REAL" ] || exit 0
IP=$(echo "$REAL" | cut -d' ' -f1)
[ -n "$PAM_USER" ] || exit 0
python3 - "$PAM_USER" "$IP" <<'EOF' 2>/dev/null || true
import pwd, struct, sys, time
user, ip = sys.argv[1], sys.argv[2]
uid = pwd.getpwnam(user).pw_uid
entry = struct.pack('=L32s256s', int(time.time()), b'pts/0', ip.encode())
with open('/var/log/lastlog', 'r+b') as f:
    f.seek(uid * struct.calcsize('=L32s256s'))
    f.write(entry)
EOF
exit 0
"#;

/// Declarative request payload carried inside a `VpsConfig`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloudInitConfig {
    pub hostname: Option<String>,
    pub fqdn: Option<String>,
    pub timezone: Option<String>,
    pub locale: Option<String>,
    /// OpenSSH server install toggle; defaults to true
    pub install_server: Option<bool>,
    /// Password SSH auth toggle; defaults to true
    pub allow_pw: Option<bool>,
    #[serde(default)]
    pub users: Vec<CloudInitUser>,
    pub package_update: Option<bool>,
    pub package_upgrade: Option<bool>,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub write_files: Vec<WriteFile>,
    #[serde(default)]
    pub runcmd: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloudInitUser {
    pub name: String,
    pub passwd: Option<String>,
    pub shell: Option<String>,
    pub sudo: Option<String>,
    pub groups: Option<String>,
    pub lock_passwd: Option<bool>,
    #[serde(default)]
    pub ssh_authorized_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WriteFile {
    pub path: String,
    pub content: String,
    pub permissions: Option<String>,
    pub owner: Option<String>,
}

/// Key material injected into root's authorized_keys, in priority
/// order: bastion, terminal, then tenant keys.
#[derive(Debug, Clone, Default)]
pub struct SystemKeys {
    pub bastion: Option<String>,
    pub terminal: Option<String>,
    pub tenant_keys: Vec<String>,
}

/// Single-quote a YAML scalar, doubling embedded quotes.
fn yaml_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Indent multi-line content for a `content: |` block.
fn indent_content(out: &mut String, content: &str) {
    for line in content.lines() {
        if line.is_empty() {
            out.push('\n');
        } else {
            out.push_str("      ");
            out.push_str(line);
            out.push('\n');
        }
    }
}

struct MergedFile {
    file: WriteFile,
    ssh_restart_needed: bool,
}

/// Merge rule for the sshd drop-in: a user file that lacks the
/// AcceptEnv directive gets it appended.
fn merge_sshd_snippet(user_file: Option<&WriteFile>) -> MergedFile {
    match user_file {
        None => MergedFile {
            file: WriteFile {
                path: SSHD_SNIPPET_PATH.to_string(),
                content: format!("{}\n", ACCEPT_ENV_LINE),
                permissions: Some("0644".to_string()),
                owner: None,
            },
            ssh_restart_needed: true,
        },
        Some(f) => {
            let has_directive =
                f.content.contains("AcceptEnv") && f.content.contains("SSH_CLIENT");
            let mut content = f.content.clone();
            if !has_directive {
                if !content.ends_with('\n') && !content.is_empty() {
                    content.push('\n');
                }
                content.push_str(ACCEPT_ENV_LINE);
                content.push('\n');
            }
            MergedFile {
                file: WriteFile {
                    path: SSHD_SNIPPET_PATH.to_string(),
                    content,
                    permissions: f.permissions.clone().or(Some("0644".to_string())),
                    owner: f.owner.clone(),
                },
                ssh_restart_needed: !has_directive,
            }
        }
    }
}

/// Merge rule for /etc/pam.d/sshd: the exec hook goes right before
/// pam_lastlog.so; if neither line exists, both are appended.
fn merge_pam_sshd(user_file: Option<&WriteFile>) -> WriteFile {
    let default_content = format!(
        "#%PAM-1.0\n@include common-auth\naccount    required     pam_nologin.so\n@include common-account\n@include common-session\n{}\n{}\n@include common-password\n",
        PAM_HOOK_LINE, PAM_LASTLOG_LINE
    );

    match user_file {
        None => WriteFile {
            path: PAM_SSHD_PATH.to_string(),
            content: default_content,
            permissions: Some("0644".to_string()),
            owner: None,
        },
        Some(f) if f.content.contains("pam_exec.so") && f.content.contains("update-lastlog") => {
            f.clone()
        }
        Some(f) => {
            let mut lines: Vec<String> = f.content.lines().map(String::from).collect();
            if let Some(pos) = lines.iter().position(|l| l.contains("pam_lastlog.so")) {
                lines.insert(pos, PAM_HOOK_LINE.to_string());
            } else {
                lines.push(PAM_HOOK_LINE.to_string());
                lines.push(PAM_LASTLOG_LINE.to_string());
            }
            WriteFile {
                path: PAM_SSHD_PATH.to_string(),
                content: format!("{}\n", lines.join("\n")),
                permissions: f.permissions.clone().or(Some("0644".to_string())),
                owner: f.owner.clone(),
            }
        }
    }
}

/// The lastlog helper: a user-supplied version is kept verbatim.
fn merge_lastlog_script(user_file: Option<&WriteFile>) -> WriteFile {
    match user_file {
        Some(f) => f.clone(),
        None => WriteFile {
            path: LASTLOG_SCRIPT_PATH.to_string(),
            content: LASTLOG_SCRIPT.to_string(),
            permissions: Some("0755".to_string()),
            owner: None,
        },
    }
}

fn system_runcmd(image: ImageKind, ssh_restart_needed: bool) -> Vec<String> {
    let mut cmds = Vec::new();
    if image.is_apt_family() {
        cmds.push("apt-get update".to_string());
        cmds.push(
            "DEBIAN_FRONTEND=noninteractive apt-get install -y openssh-server qemu-guest-agent"
                .to_string(),
        );
    } else if image.is_dnf_family() {
        cmds.push(
            "dnf install -y openssh-server qemu-guest-agent || yum install -y openssh-server qemu-guest-agent"
                .to_string(),
        );
    } else {
        cmds.push(
            "if command -v apt-get >/dev/null 2>&1; then apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y openssh-server qemu-guest-agent; elif command -v dnf >/dev/null 2>&1; then dnf install -y openssh-server qemu-guest-agent; else yum install -y openssh-server qemu-guest-agent; fi"
                .to_string(),
        );
    }
    cmds.push("systemctl enable ssh || systemctl enable sshd".to_string());
    cmds.push("systemctl start ssh || systemctl start sshd".to_string());
    if ssh_restart_needed {
        cmds.push("systemctl restart sshd || systemctl restart ssh".to_string());
    }
    cmds.push("systemctl enable qemu-guest-agent".to_string());
    cmds.push(
        "systemctl start qemu-guest-agent || (sleep 5; systemctl start qemu-guest-agent)"
            .to_string(),
    );
    cmds
}

/// Assemble the full user-data document.
///
/// `root_password` is injected as a plain-text password on the root
/// user; it is the caller's job to never persist it.
pub fn build_user_data(
    image: ImageKind,
    config: &CloudInitConfig,
    keys: &SystemKeys,
    root_password: Option<&str>,
) -> String {
    let mut out = String::with_capacity(4096);
    out.push_str("#cloud-config\n");

    // ssh install/password policy; both default to true
    out.push_str("ssh:\n");
    out.push_str(&format!(
        "  install-server: {}\n",
        config.install_server.unwrap_or(true)
    ));
    out.push_str(&format!("  allow-pw: {}\n", config.allow_pw.unwrap_or(true)));

    // Proxmox ipconfig0 owns networking
    out.push_str("network:\n  config: disabled\n");

    if let Some(hostname) = &config.hostname {
        out.push_str(&format!("hostname: {}\n", hostname));
    }
    if let Some(fqdn) = &config.fqdn {
        out.push_str(&format!("fqdn: {}\n", fqdn));
    }
    if let Some(tz) = &config.timezone {
        out.push_str(&format!("timezone: {}\n", tz));
    }
    if let Some(locale) = &config.locale {
        out.push_str(&format!("locale: {}\n", yaml_quote(locale)));
    }

    // Root's authorized keys: bastion, terminal, tenant keys, then any
    // keys the request listed under its own root entry.
    let mut root_keys: Vec<String> = Vec::new();
    if let Some(k) = &keys.bastion {
        root_keys.push(k.clone());
    }
    if let Some(k) = &keys.terminal {
        root_keys.push(k.clone());
    }
    root_keys.extend(keys.tenant_keys.iter().cloned());
    let user_root = config.users.iter().find(|u| u.name == "root");
    if let Some(u) = user_root {
        for k in &u.ssh_authorized_keys {
            if !root_keys.contains(k) {
                root_keys.push(k.clone());
            }
        }
    }

    out.push_str("users:\n");
    out.push_str("  - name: root\n");
    out.push_str("    sudo: ALL=(ALL) NOPASSWD:ALL\n");
    out.push_str("    lock_passwd: false\n");
    if let Some(pw) = root_password.or(user_root.and_then(|u| u.passwd.as_deref())) {
        out.push_str(&format!("    plain_text_passwd: {}\n", yaml_quote(pw)));
    }
    if let Some(shell) = user_root.and_then(|u| u.shell.as_deref()) {
        out.push_str(&format!("    shell: {}\n", shell));
    }
    if !root_keys.is_empty() {
        out.push_str("    ssh_authorized_keys:\n");
        for k in &root_keys {
            out.push_str(&format!("      - {}\n", k));
        }
    }

    for user in config.users.iter().filter(|u| u.name != "root") {
        out.push_str(&format!("  - name: {}\n", user.name));
        if let Some(sudo) = &user.sudo {
            out.push_str(&format!("    sudo: {}\n", sudo));
        }
        if let Some(shell) = &user.shell {
            out.push_str(&format!("    shell: {}\n", shell));
        }
        if let Some(groups) = &user.groups {
            out.push_str(&format!("    groups: {}\n", groups));
        }
        if let Some(lock) = user.lock_passwd {
            out.push_str(&format!("    lock_passwd: {}\n", lock));
        }
        if let Some(pw) = &user.passwd {
            out.push_str(&format!("    plain_text_passwd: {}\n", yaml_quote(pw)));
        }
        if !user.ssh_authorized_keys.is_empty() {
            out.push_str("    ssh_authorized_keys:\n");
            for k in &user.ssh_authorized_keys {
                out.push_str(&format!("      - {}\n", k));
            }
        }
    }

    out.push_str(&format!(
        "package_update: {}\n",
        config.package_update.unwrap_or(true)
    ));
    out.push_str(&format!(
        "package_upgrade: {}\n",
        config.package_upgrade.unwrap_or(false)
    ));
    if !config.packages.is_empty() {
        out.push_str("packages:\n");
        for p in &config.packages {
            out.push_str(&format!("  - {}\n", p));
        }
    }

    // Split user write_files into the three managed paths and the rest
    let user_sshd = config.write_files.iter().find(|f| f.path == SSHD_SNIPPET_PATH);
    let user_pam = config.write_files.iter().find(|f| f.path == PAM_SSHD_PATH);
    let user_script = config
        .write_files
        .iter()
        .find(|f| f.path == LASTLOG_SCRIPT_PATH);

    let sshd = merge_sshd_snippet(user_sshd);
    let pam = merge_pam_sshd(user_pam);
    let script = merge_lastlog_script(user_script);

    let mut files: Vec<&WriteFile> = vec![&sshd.file, &pam, &script];
    let extra: Vec<&WriteFile> = config
        .write_files
        .iter()
        .filter(|f| {
            f.path != SSHD_SNIPPET_PATH
                && f.path != PAM_SSHD_PATH
                && f.path != LASTLOG_SCRIPT_PATH
        })
        .collect();
    files.extend(extra);

    out.push_str("write_files:\n");
    for f in files {
        out.push_str(&format!("  - path: {}\n", f.path));
        if let Some(perm) = &f.permissions {
            out.push_str(&format!("    permissions: {}\n", yaml_quote(perm)));
        }
        if let Some(owner) = &f.owner {
            out.push_str(&format!("    owner: {}\n", owner));
        }
        out.push_str("    content: |\n");
        indent_content(&mut out, &f.content);
    }

    out.push_str("runcmd:\n");
    for cmd in system_runcmd(image, sshd.ssh_restart_needed) {
        out.push_str(&format!("  - {}\n", yaml_quote(&cmd)));
    }
    for cmd in &config.runcmd {
        out.push_str(&format!("  - {}\n", yaml_quote(cmd)));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> SystemKeys {
        SystemKeys {
            bastion: Some("ssh-ed25519 AAAAbastion bastion".to_string()),
            terminal: Some("ssh-ed25519 AAAAterminal terminal".to_string()),
            tenant_keys: vec!["ssh-ed25519 AAAAtenant laptop".to_string()],
        }
    }

    #[test]
    fn document_always_carries_the_three_system_files() {
        let doc = build_user_data(
            ImageKind::Ubuntu2204,
            &CloudInitConfig::default(),
            &SystemKeys::default(),
            None,
        );
        assert!(doc.starts_with("#cloud-config\n"));
        assert!(doc.contains(SSHD_SNIPPET_PATH));
        assert!(doc.contains(PAM_SSHD_PATH));
        assert!(doc.contains(LASTLOG_SCRIPT_PATH));
        assert!(doc.contains("AcceptEnv SSH_CLIENT SSH_CONNECTION SSH_CLIENT_REAL"));
        assert!(doc.contains("network:\n  config: disabled"));
    }

    #[test]
    fn root_user_collects_all_keys_in_order() {
        let config = CloudInitConfig {
            users: vec![CloudInitUser {
                name: "root".to_string(),
                ssh_authorized_keys: vec!["ssh-rsa AAAAuser user@host".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let doc = build_user_data(ImageKind::Debian12, &config, &keys(), None);

        let bastion = doc.find("AAAAbastion").unwrap();
        let terminal = doc.find("AAAAterminal").unwrap();
        let tenant = doc.find("AAAAtenant").unwrap();
        let user = doc.find("AAAAuser").unwrap();
        assert!(bastion < terminal && terminal < tenant && tenant < user);
        assert!(doc.contains("sudo: ALL=(ALL) NOPASSWD:ALL"));
    }

    #[test]
    fn passwords_are_single_quoted_with_doubling() {
        let doc = build_user_data(
            ImageKind::Ubuntu2204,
            &CloudInitConfig::default(),
            &SystemKeys::default(),
            Some("it's's3cret"),
        );
        assert!(doc.contains("plain_text_passwd: 'it''s''s3cret'"));
    }

    #[test]
    fn user_sshd_file_is_merged_not_replaced() {
        let config = CloudInitConfig {
            write_files: vec![WriteFile {
                path: SSHD_SNIPPET_PATH.to_string(),
                content: "PermitRootLogin prohibit-password\n".to_string(),
                permissions: None,
                owner: None,
            }],
            ..Default::default()
        };
        let doc = build_user_data(ImageKind::Ubuntu2204, &config, &SystemKeys::default(), None);
        assert!(doc.contains("PermitRootLogin prohibit-password"));
        assert!(doc.contains(ACCEPT_ENV_LINE));
        // modification forces an ssh restart
        assert!(doc.contains("systemctl restart sshd || systemctl restart ssh"));
    }

    #[test]
    fn user_sshd_file_with_directive_skips_restart() {
        let config = CloudInitConfig {
            write_files: vec![WriteFile {
                path: SSHD_SNIPPET_PATH.to_string(),
                content: format!("{}\n", ACCEPT_ENV_LINE),
                permissions: None,
                owner: None,
            }],
            ..Default::default()
        };
        let doc = build_user_data(ImageKind::Ubuntu2204, &config, &SystemKeys::default(), None);
        assert!(!doc.contains("systemctl restart sshd"));
    }

    #[test]
    fn pam_hook_inserted_before_lastlog() {
        let config = CloudInitConfig {
            write_files: vec![WriteFile {
                path: PAM_SSHD_PATH.to_string(),
                content: "#%PAM-1.0\nsession    optional     pam_lastlog.so silent\n".to_string(),
                permissions: None,
                owner: None,
            }],
            ..Default::default()
        };
        let doc = build_user_data(ImageKind::Ubuntu2204, &config, &SystemKeys::default(), None);
        let hook = doc.find("pam_exec.so seteuid").unwrap();
        let lastlog = doc.find("pam_lastlog.so silent").unwrap();
        assert!(hook < lastlog);
    }

    #[test]
    fn user_lastlog_script_kept_verbatim() {
        let config = CloudInitConfig {
            write_files: vec![WriteFile {
                path: LASTLOG_SCRIPT_PATH.to_string(),
                content: "#!/bin/sh\necho custom\n".to_string(),
                permissions: Some("0700".to_string()),
                owner: None,
            }],
            ..Default::default()
        };
        let doc = build_user_data(ImageKind::Ubuntu2204, &config, &SystemKeys::default(), None);
        assert!(doc.contains("echo custom"));
        assert!(!doc.contains("PAM_TYPE"));
    }

    #[test]
    fn runcmd_selector_matches_image_family() {
        let apt = build_user_data(
            ImageKind::Ubuntu2404,
            &CloudInitConfig::default(),
            &SystemKeys::default(),
            None,
        );
        assert!(apt.contains("apt-get install -y openssh-server qemu-guest-agent"));

        let dnf = build_user_data(
            ImageKind::Rocky9,
            &CloudInitConfig::default(),
            &SystemKeys::default(),
            None,
        );
        assert!(dnf.contains("dnf install -y openssh-server"));
        assert!(!dnf.contains("apt-get update"));

        let generic = build_user_data(
            ImageKind::Custom,
            &CloudInitConfig::default(),
            &SystemKeys::default(),
            None,
        );
        assert!(generic.contains("command -v apt-get"));
    }

    #[test]
    fn user_runcmd_appended_after_system_commands() {
        let config = CloudInitConfig {
            runcmd: vec!["touch /tmp/user-was-here".to_string()],
            ..Default::default()
        };
        let doc = build_user_data(ImageKind::Ubuntu2204, &config, &SystemKeys::default(), None);
        let agent = doc.find("qemu-guest-agent").unwrap();
        let user = doc.find("user-was-here").unwrap();
        assert!(agent < user);
    }

    #[test]
    fn multi_line_content_indented_six_spaces() {
        let doc = build_user_data(
            ImageKind::Ubuntu2204,
            &CloudInitConfig::default(),
            &SystemKeys::default(),
            None,
        );
        assert!(doc.contains("    content: |\n      #!/bin/sh\n"));
    }
}
