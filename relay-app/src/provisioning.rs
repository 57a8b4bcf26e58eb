//! Pterodactyl installer catalog: shell commands and operator texts.

pub const INSTALLER_URL: &str = "https://pterodactyl-installer.se";
pub const SAFE_INSTALL_SCRIPT: &str = "/tmp/ptero.sh";
const PREVIEW_LINES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
    Panel,
    Wings,
    Both,
    Uninstall,
}

impl InstallMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "panel" => Some(Self::Panel),
            "wings" => Some(Self::Wings),
            "both" => Some(Self::Both),
            "uninstall" => Some(Self::Uninstall),
            _ => None,
        }
    }

    /// `.safeinstall` never uninstalls.
    pub fn parse_verified(raw: &str) -> Option<Self> {
        Self::parse(raw).filter(|mode| *mode != Self::Uninstall)
    }

    /// The installer's interactive menu choice.
    pub fn menu_option(self) -> &'static str {
        match self {
            Self::Panel => "0",
            Self::Wings => "1",
            Self::Both => "2",
            Self::Uninstall => "6",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Panel => "panel",
            Self::Wings => "wings",
            Self::Both => "both",
            Self::Uninstall => "uninstall",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallProfile {
    Panel,
    Wings,
}

impl FirewallProfile {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "panel" => Some(Self::Panel),
            "wings" => Some(Self::Wings),
            _ => None,
        }
    }

    pub fn tcp_ports(self) -> &'static [u16] {
        match self {
            Self::Panel => &[80, 443],
            Self::Wings => &[8080, 2022],
        }
    }

    pub fn ufw_command(self) -> String {
        let mut parts: Vec<String> = self
            .tcp_ports()
            .iter()
            .map(|port| format!("ufw allow {port}/tcp"))
            .collect();
        parts.push("ufw reload".to_string());
        parts.join(" && ")
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Panel => "panel",
            Self::Wings => "wings",
        }
    }
}

/// Updates apt, installs curl and sudo, then launches the installer.
pub fn bootstrap_command() -> String {
    format!(
        "set -e && apt-get update -y && apt-get install -y curl sudo && bash <(curl -s {INSTALLER_URL})"
    )
}

pub fn download_command() -> String {
    format!("curl -fsSL {INSTALLER_URL} -o {SAFE_INSTALL_SCRIPT} && chmod +x {SAFE_INSTALL_SCRIPT}")
}

pub fn preview_command() -> String {
    format!("head -n {PREVIEW_LINES} {SAFE_INSTALL_SCRIPT}")
}

pub fn checksum_command() -> String {
    format!("sha256sum {SAFE_INSTALL_SCRIPT}")
}

pub fn run_downloaded_command() -> String {
    format!("bash {SAFE_INSTALL_SCRIPT}")
}

pub const HELP_TEXT: &str = "\
*SHELLRELAY COMMANDS*

*Connection*
• .connect <PIN> <host> [user] [port]
  Request an SSH session to a host
• .confirm YA
  Confirm the pending connection (.ya works too)
• .close
  Close the current session and receive its audit log
• .status
  Show the current session
• .switch <host>
  Select another open session

*Pterodactyl install*
• .install panel | wings | both | uninstall
  Run the installer (menu option 0, 1, 2 or 6)
• .safeinstall panel | wings | both
  Download, preview and checksum the installer before running it
• .dryrun <host>
  Describe the install steps without running anything

*Shell control*
• .send <text>
  Type a line into the remote shell
• .enter
  Press ENTER
• .ctrlc
  Send Ctrl+C

*Firewall*
• .ufw open panel
  Allow TCP 80 and 443
• .ufw open wings
  Allow TCP 8080 and 2022

*Safety*
• .panic
  Close every session and block all commands
• .unpanic
  Leave panic mode

• .help / .menu
  Show this message

Notes: only the owner can use this relay, the PIN is required to connect, \
every session is logged, and idle sessions close automatically.";

pub fn dry_run_plan(redacted_host: &str) -> String {
    format!(
        "\
🔍 *DRY RUN*

Host: {redacted_host}

Steps that would run:

1. Update package lists
   `apt-get update -y`
2. Install dependencies
   `apt-get install -y curl sudo`
3. Fetch the installer
   `curl -s {INSTALLER_URL}`
4. Run the installer
   `bash <(curl -s {INSTALLER_URL})`
5. Choose the install mode
   • 0 = Panel only
   • 1 = Wings only
   • 2 = Panel + Wings
   • 6 = Uninstall
6. Answer the installer prompts
   database host, name and user, FQDN, email for SSL, timezone, admin user
7. Installation runs unattended
8. Health check afterwards
   `systemctl status nginx mariadb redis`

Nothing was executed. Use .connect to run it for real."
    )
}
