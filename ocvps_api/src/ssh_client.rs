//! Thin wrapper over an `ssh2` session.
//!
//! Used for the pieces the Proxmox REST API cannot do: writing
//! cloud-init snippets into storage, probing disk paths, and running
//! `qemu-img` during cross-storage conversion.

use crate::settings::{SshAuth, SshSettings, decode_key_data};
use anyhow::{Result, bail};
use log::info;
use std::io::{Read, Write};
use tokio::net::{TcpStream, ToSocketAddrs};

pub struct SshClient {
    session: ssh2::Session,
}

impl SshClient {
    pub fn new() -> Result<SshClient> {
        let session = ssh2::Session::new()?;
        Ok(SshClient { session })
    }

    /// Connect and authenticate with the configured credentials.
    pub async fn connect(
        &mut self,
        host: impl ToSocketAddrs,
        settings: &SshSettings,
    ) -> Result<()> {
        let tcp = TcpStream::connect(host).await?;
        self.session.set_tcp_stream(tcp);
        self.session.handshake()?;
        match &settings.auth {
            SshAuth::KeyFile(path) => {
                self.session
                    .userauth_pubkey_file(&settings.user, None, path, None)?;
            }
            SshAuth::KeyData(data) => {
                let pem = decode_key_data(data)?;
                self.session
                    .userauth_pubkey_memory(&settings.user, None, &pem, None)?;
            }
        }
        Ok(())
    }

    /// Run a command and collect `(exit_code, stdout+stderr)`.
    pub async fn execute(&mut self, command: &str) -> Result<(i32, String)> {
        info!("Executing command: {}", command);
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;
        let mut s = String::new();
        channel.read_to_string(&mut s)?;
        let mut err = String::new();
        channel.stderr().read_to_string(&mut err)?;
        channel.wait_close()?;
        if !err.is_empty() {
            s.push_str(&err);
        }
        Ok((channel.exit_status()?, s))
    }

    /// Run a command feeding `input` to its stdin, then collect the
    /// exit code and output. This is how snippet files are written:
    /// `dd of=<path> bs=8192` with the document piped in.
    pub async fn execute_with_stdin(
        &mut self,
        command: &str,
        input: &[u8],
    ) -> Result<(i32, String)> {
        info!("Executing command: {} ({} bytes on stdin)", command, input.len());
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;
        channel.write_all(input)?;
        channel.send_eof()?;
        let mut s = String::new();
        channel.read_to_string(&mut s)?;
        channel.wait_close()?;
        Ok((channel.exit_status()?, s))
    }

    /// Run a command, failing unless it exits zero.
    pub async fn execute_checked(&mut self, command: &str) -> Result<String> {
        let (code, out) = self.execute(command).await?;
        if code != 0 {
            bail!("command failed with exit-code {}: {}: {}", code, command, out);
        }
        Ok(out)
    }
}
