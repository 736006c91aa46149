#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use relaybot_platform::{SecretString, TokenStore, Tokens};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenFile {
	access_token: Option<String>,
	refresh_token: Option<String>,
}

/// Bot OAuth tokens persisted as TOML next to the config.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
	path: PathBuf,
}

impl FileTokenStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// `None` when nothing has been persisted yet.
	pub fn load(&self) -> anyhow::Result<Option<Tokens>> {
		let raw = match fs::read_to_string(&self.path) {
			Ok(raw) => raw,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(anyhow!(e).context(format!("read {}", self.path.display()))),
		};
		let file: TokenFile = toml::from_str(&raw).with_context(|| format!("parse {}", self.path.display()))?;
		let tokens = Tokens::new(
			file.access_token.map(SecretString::new),
			file.refresh_token.map(SecretString::new),
		);
		Ok((tokens.access_token.is_some() || tokens.refresh_token.is_some()).then_some(tokens))
	}
}

impl TokenStore for FileTokenStore {
	fn save(&self, tokens: &Tokens) -> anyhow::Result<()> {
		if let Some(parent) = self.path.parent() {
			fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
		}
		let file = TokenFile {
			access_token: tokens.access_token.as_ref().map(|t| t.expose().to_string()),
			refresh_token: tokens.refresh_token.as_ref().map(|t| t.expose().to_string()),
		};
		let data = toml::to_string_pretty(&file).context("serialize tokens")?;

		// Write-then-rename so a crash never leaves a truncated file.
		let tmp = self.path.with_extension("toml.tmp");
		fs::write(&tmp, data).with_context(|| format!("write {}", tmp.display()))?;
		restrict_permissions(&tmp)?;
		fs::rename(&tmp, &self.path).with_context(|| format!("rename into {}", self.path.display()))?;
		Ok(())
	}
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> anyhow::Result<()> {
	use std::os::unix::fs::PermissionsExt;
	fs::set_permissions(path, fs::Permissions::from_mode(0o600)).with_context(|| format!("chmod {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> anyhow::Result<()> {
	Ok(())
}
