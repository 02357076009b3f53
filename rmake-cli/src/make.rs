//! `rmake make`: upload a source file, build it remotely, and save the outputs.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rmake::rmake_proto::{DEFAULT_PORT, MakeRequest};
use rmake::{Client, MakeEvent, Output};
use tracing::debug;

/// Arguments for `rmake make`.
///
/// Usage: `rmake make [OPTIONS] --user USER --password PASSWORD FILE`
#[derive(clap::Args)]
pub struct MakeArgs {
    /// Source file to build. It is uploaded under its file name.
    file: PathBuf,

    /// Extra files to upload, named by their relative path.
    #[arg(short = 'i', long = "include")]
    include: Vec<PathBuf>,

    /// Daemon address.
    #[arg(short, long, env = "RMAKE_SERVER", default_value_t = format!("127.0.0.1:{DEFAULT_PORT}"))]
    server: String,

    /// User name.
    #[arg(short, long, env = "RMAKE_USER")]
    user: String,

    /// Password.
    #[arg(long, env = "RMAKE_PASSWORD", hide_env_values = true)]
    password: String,

    /// Salt the daemon appends to passwords.
    #[arg(long, env = "RMAKE_SALT", default_value = "")]
    salt: String,

    /// Recipe to use. Selected by file name when omitted.
    #[arg(short = 't', long = "type", default_value = "")]
    recipe_type: String,

    /// Recipe option (format: KEY=VALUE).
    #[arg(short = 'o', long = "option", value_parser = parse_option)]
    options: Vec<(String, String)>,

    /// Directory output files are written to.
    #[arg(short = 'C', long, default_value = ".")]
    out_dir: PathBuf,

    /// Largest output file accepted, in bytes.
    #[arg(long, default_value_t = rmake::DEFAULT_MAX_FILE_LEN)]
    max_file_len: u64,
}

impl MakeArgs {
    pub async fn run(self) -> Result<()> {
        let name = self
            .file
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("{}: not a UTF-8 file name", self.file.display()))?
            .to_owned();

        let mut files = vec![(name.clone(), read(&self.file).await?)];
        for path in &self.include {
            let upload = upload_name(path)?;
            files.push((upload, read(path).await?));
        }

        let request = MakeRequest {
            recipe_type: self.recipe_type,
            filenames: vec![name],
            options: self.options.into_iter().collect(),
        };

        let mut client = Client::connect(self.server.as_str())
            .await
            .with_context(|| format!("connecting to {}", self.server))?
            .max_file_len(self.max_file_len);
        client
            .authenticate(&self.user, &self.password, &self.salt)
            .await
            .with_context(|| format!("authenticating as {}", self.user))?;

        let result = client.make(&request, &files, print_event).await?;
        debug!(recipe = %result.recipe, outputs = result.outputs.len(), "make finished");

        for path in write_outputs(&self.out_dir, &result.outputs).await? {
            println!("{}", path.display());
        }
        client.goodbye().await?;
        Ok(())
    }
}

async fn read(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))
}

/// Name an extra file is uploaded under: its relative path, `/`-separated.
fn upload_name(path: &Path) -> Result<String> {
    if path.is_absolute() {
        bail!("{}: include paths must be relative", path.display());
    }
    let parts = path
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()
        .with_context(|| format!("{}: not a UTF-8 path", path.display()))?;
    Ok(parts.join("/"))
}

fn parse_option(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

fn print_event(event: MakeEvent) {
    match event {
        MakeEvent::Status(text) => eprintln!("{}", text.trim_end()),
        MakeEvent::Stdout(data) => {
            let _ = std::io::stdout().write_all(&data);
        }
        MakeEvent::Stderr(data) => {
            let _ = std::io::stderr().write_all(&data);
        }
        _ => {}
    }
}

/// Writes every output under `dir`, refusing names that escape it.
async fn write_outputs(dir: &Path, outputs: &[Output]) -> Result<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(outputs.len());
    for out in outputs {
        let path = rmake::confined_path(dir, &out.name)
            .with_context(|| format!("refusing output {:?} outside {}", out.name, dir.display()))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &out.data)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options() {
        assert_eq!(parse_option("opt=-O2").unwrap(), ("opt".into(), "-O2".into()));
        assert_eq!(parse_option("k=a=b").unwrap(), ("k".into(), "a=b".into()));
        assert_eq!(parse_option("empty=").unwrap(), ("empty".into(), String::new()));
        assert!(parse_option("=v").is_err());
        assert!(parse_option("novalue").is_err());
    }

    #[test]
    fn upload_names() {
        assert_eq!(upload_name(Path::new("inc/util.h")).unwrap(), "inc/util.h");
        assert!(upload_name(Path::new("/etc/passwd")).is_err());
    }

    #[tokio::test]
    async fn outputs_are_written_below_out_dir() {
        let dir = tempfile::tempdir().unwrap();
        let outputs = [
            Output::new("a.out", b"bin".to_vec()),
            Output::new("obj/main.o", b"obj".to_vec()),
        ];
        let written = write_outputs(dir.path(), &outputs).await.unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(std::fs::read(dir.path().join("a.out")).unwrap(), b"bin");
        assert_eq!(std::fs::read(dir.path().join("obj/main.o")).unwrap(), b"obj");
    }

    #[tokio::test]
    async fn escaping_output_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let outputs = [Output::new("../evil", b"x".to_vec())];
        assert!(write_outputs(&dir.path().join("out"), &outputs).await.is_err());
        assert!(!dir.path().join("evil").exists());
    }
}
