//! Fixed command menu: single-digit codes mapped to remote shell actions

use super::shell::RemoteShell;
use std::fmt;

pub const USAGE: &str =
    "Invalid command. Use: 1 (list files), 2 (IP addresses), 3 (available RAM), 4 (create file)";

const FILE_CONTENT: &str = "Created by MQTT agent";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteAction {
    ListFiles,
    IpAddresses,
    AvailableRam,
    CreateFile,
}

impl RemoteAction {
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "1" => Some(RemoteAction::ListFiles),
            "2" => Some(RemoteAction::IpAddresses),
            "3" => Some(RemoteAction::AvailableRam),
            "4" => Some(RemoteAction::CreateFile),
            _ => None,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            RemoteAction::ListFiles => "1",
            RemoteAction::IpAddresses => "2",
            RemoteAction::AvailableRam => "3",
            RemoteAction::CreateFile => "4",
        }
    }
}

impl fmt::Display for RemoteAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            RemoteAction::ListFiles => "list files",
            RemoteAction::IpAddresses => "IP addresses",
            RemoteAction::AvailableRam => "available RAM",
            RemoteAction::CreateFile => "create file",
        };
        write!(f, "{} ({})", self.code(), name)
    }
}

/// Runs the command named by `payload` and returns the text to publish.
///
/// Shell failures come back as their `SSH error:` / `SSH connection failed:` text;
/// nothing here is raised to the caller. `unix_time` names the file for action 4.
pub async fn execute<S>(shell: &S, payload: &str, unix_time: i64) -> String
where
    S: RemoteShell + ?Sized,
{
    let Some(action) = RemoteAction::from_code(payload) else {
        return USAGE.to_string();
    };

    match action {
        RemoteAction::ListFiles => match shell.run("ls").await {
            Ok(output) => format!(
                "Current directory files:\n{}",
                output.lines().collect::<Vec<_>>().join("\n")
            ),
            Err(e) => e.to_string(),
        },
        RemoteAction::IpAddresses => match shell.run("ip addr show").await {
            Ok(output) => format!("IP addresses:\n{}", inet_addresses(&output).join("\n")),
            Err(e) => e.to_string(),
        },
        RemoteAction::AvailableRam => match shell.run("free -m | grep Mem").await {
            Ok(output) => match available_mb(&output) {
                Some(mb) => format!("Available RAM: {} MB", mb),
                None => format!("Error getting memory: unexpected output '{}'", output),
            },
            Err(e) => e.to_string(),
        },
        RemoteAction::CreateFile => {
            let filename = format!("new_file_{}.txt", unix_time);
            let command = format!("echo '{}' > {}", FILE_CONTENT, filename);
            match shell.run(&command).await {
                Ok(_) => format!("Created file: {}", filename),
                Err(e) => e.to_string(),
            }
        }
    }
}

/// IPv4 addresses from `ip addr show`, prefix length stripped
fn inet_addresses(output: &str) -> Vec<&str> {
    output
        .lines()
        .filter(|line| line.contains("inet "))
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|cidr| cidr.split('/').next().unwrap_or(cidr))
        .collect()
}

/// Fourth column of the `Mem:` row of `free -m`
fn available_mb(output: &str) -> Option<&str> {
    output.split_whitespace().nth(3)
}
