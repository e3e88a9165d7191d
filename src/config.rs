//! Configuration: a subset of OpenVPN directives parsed into immutable
//! session `Options`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

/// Transport protocol selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Udp,
    Tcp,
}

impl Proto {
    /// The token advertised in the options string.
    pub fn options_token(self) -> &'static str {
        match self {
            Self::Udp => "UDPv4",
            Self::Tcp => "TCPv4",
        }
    }
}

/// Data-channel ciphers this client can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    Aes128Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes256Gcm,
}

impl Cipher {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "AES-128-CBC" => Ok(Self::Aes128Cbc),
            "AES-256-CBC" => Ok(Self::Aes256Cbc),
            "AES-128-GCM" => Ok(Self::Aes128Gcm),
            "AES-256-GCM" => Ok(Self::Aes256Gcm),
            other => Err(Error::config(format!("unsupported cipher: {other}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Aes128Cbc => "AES-128-CBC",
            Self::Aes256Cbc => "AES-256-CBC",
            Self::Aes128Gcm => "AES-128-GCM",
            Self::Aes256Gcm => "AES-256-GCM",
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            Self::Aes128Cbc | Self::Aes128Gcm => 16,
            Self::Aes256Cbc | Self::Aes256Gcm => 32,
        }
    }

    pub fn key_bits(self) -> usize {
        self.key_len() * 8
    }

    pub fn is_aead(self) -> bool {
        matches!(self, Self::Aes128Gcm | Self::Aes256Gcm)
    }
}

/// HMAC digests for the CBC data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDigest {
    Sha1,
    Sha256,
    Sha512,
}

impl AuthDigest {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "SHA1" => Ok(Self::Sha1),
            "SHA256" => Ok(Self::Sha256),
            "SHA512" => Ok(Self::Sha512),
            other => Err(Error::config(format!("unsupported auth digest: {other}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }
}

/// Session options, immutable once the handshake starts.
///
/// Certificates and keys are held as PEM bytes; parsing into DER happens
/// when the TLS configuration is built.
#[derive(Debug, Clone)]
pub struct Options {
    pub remote: String,
    pub port: u16,
    pub proto: Proto,
    pub cipher: Cipher,
    pub auth: AuthDigest,
    pub ca: Vec<u8>,
    pub cert: Option<Vec<u8>>,
    pub key: Option<Vec<u8>>,
    pub compress_stub: bool,
    pub username: Option<String>,
    pub password: Option<String>,

    /// Initial control-channel retransmit interval.
    pub retransmit_initial: Duration,
    /// Back-off cap for the retransmit interval.
    pub retransmit_cap: Duration,
    /// Retransmits allowed per control packet before giving up.
    pub retransmit_budget: u32,
    /// Overall handshake deadline.
    pub handshake_deadline: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            remote: String::new(),
            port: crate::DEFAULT_PORT,
            proto: Proto::Udp,
            cipher: Cipher::Aes256Gcm,
            auth: AuthDigest::Sha256,
            ca: Vec::new(),
            cert: None,
            key: None,
            compress_stub: false,
            username: None,
            password: None,
            retransmit_initial: Duration::from_secs(2),
            retransmit_cap: Duration::from_secs(60),
            retransmit_budget: 5,
            handshake_deadline: Duration::from_secs(120),
        }
    }
}

impl Options {
    /// The `host:port` endpoint to dial.
    pub fn remote_endpoint(&self) -> String {
        format!("{}:{}", self.remote, self.port)
    }

    /// The canonical options string advertised in the control message.
    pub fn advertised(&self) -> String {
        let mut s = format!(
            "V4,dev-type tun,link-mtu 1500,tun-mtu 1500,proto {},cipher {},auth {},keysize {},key-method 2,tls-client",
            self.proto.options_token(),
            self.cipher.name(),
            self.auth.name(),
            self.cipher.key_bits(),
        );
        if self.compress_stub {
            s.push_str(",comp-lzo no");
        }
        s
    }

    /// Check that the options describe a dialable, authenticatable session.
    pub fn validate(&self) -> Result<()> {
        if self.remote.is_empty() {
            return Err(Error::config("remote server not set"));
        }
        if self.port == 0 {
            return Err(Error::config("port cannot be zero"));
        }
        if self.ca.is_empty() {
            return Err(Error::config("ca certificate not set"));
        }
        if self.cert.is_some() != self.key.is_some() {
            return Err(Error::config(
                "client certificate and key must be provided together",
            ));
        }
        if self.cert.is_none() && self.username.is_none() {
            return Err(Error::config(
                "either a client certificate or auth-user-pass is required",
            ));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(Error::config("username and password must come together"));
        }
        Ok(())
    }
}

/// Parse an OpenVPN-style configuration file.
///
/// Paths in `ca`/`cert`/`key`/`auth-user-pass` directives resolve relative
/// to the config file's directory.
pub fn parse_config_file<P: AsRef<Path>>(path: P) -> Result<Options> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
    parse_config(&text, path.parent())
}

/// Parse configuration text. Unknown directives are logged and skipped.
pub fn parse_config(text: &str, base_dir: Option<&Path>) -> Result<Options> {
    let mut options = Options::default();
    let mut inline: Option<(String, Vec<String>)> = None;

    for raw in text.lines() {
        let line = raw.trim();

        // Inline PEM block in progress.
        if let Some((tag, lines)) = inline.as_mut() {
            if line != format!("</{tag}>") {
                lines.push(raw.to_string());
                continue;
            }
            let (tag, lines) = inline.take().unwrap_or_default();
            let pem = lines.join("\n").into_bytes();
            match tag.as_str() {
                "ca" => options.ca = pem,
                "cert" => options.cert = Some(pem),
                "key" => options.key = Some(pem),
                _ => unreachable!(),
            }
            continue;
        }

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(tag) = line
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .filter(|t| matches!(*t, "ca" | "cert" | "key"))
        {
            inline = Some((tag.to_string(), Vec::new()));
            continue;
        }

        let mut parts = line.split_whitespace();
        let directive = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();

        match directive {
            "remote" => {
                let host = args
                    .first()
                    .ok_or_else(|| Error::config("remote needs a host"))?;
                options.remote = host.to_string();
                if let Some(port) = args.get(1) {
                    options.port = port
                        .parse()
                        .map_err(|_| Error::config(format!("bad port: {port}")))?;
                }
            }
            "proto" => {
                options.proto = match args.first().copied() {
                    Some("udp") | Some("udp4") => Proto::Udp,
                    Some("tcp") | Some("tcp4") | Some("tcp-client") => Proto::Tcp,
                    other => {
                        return Err(Error::config(format!(
                            "unsupported proto: {}",
                            other.unwrap_or("<missing>")
                        )))
                    }
                };
            }
            "cipher" => {
                let name = args
                    .first()
                    .ok_or_else(|| Error::config("cipher needs an argument"))?;
                options.cipher = Cipher::parse(name)?;
            }
            "auth" => {
                let name = args
                    .first()
                    .ok_or_else(|| Error::config("auth needs an argument"))?;
                options.auth = AuthDigest::parse(name)?;
            }
            "ca" => options.ca = read_relative(base_dir, args.first(), "ca")?,
            "cert" => options.cert = Some(read_relative(base_dir, args.first(), "cert")?),
            "key" => options.key = Some(read_relative(base_dir, args.first(), "key")?),
            "auth-user-pass" => {
                let raw = read_relative(base_dir, args.first(), "auth-user-pass")?;
                let text = String::from_utf8(raw)
                    .map_err(|_| Error::config("auth-user-pass file is not UTF-8"))?;
                let mut lines = text.lines();
                options.username = Some(
                    lines
                        .next()
                        .ok_or_else(|| Error::config("auth-user-pass file missing username"))?
                        .trim()
                        .to_string(),
                );
                options.password = Some(
                    lines
                        .next()
                        .ok_or_else(|| Error::config("auth-user-pass file missing password"))?
                        .trim()
                        .to_string(),
                );
            }
            "comp-lzo" => options.compress_stub = true,
            other => debug!(directive = other, "ignoring unsupported directive"),
        }
    }

    if inline.is_some() {
        return Err(Error::config("unterminated inline block"));
    }

    options.validate()?;
    Ok(options)
}

fn read_relative(base_dir: Option<&Path>, arg: Option<&&str>, what: &str) -> Result<Vec<u8>> {
    let arg = arg.ok_or_else(|| Error::config(format!("{what} needs a file argument")))?;
    let mut path = PathBuf::from(arg);
    if path.is_relative() {
        if let Some(base) = base_dir {
            path = base.join(path);
        }
    }
    fs::read(&path).map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))
}
