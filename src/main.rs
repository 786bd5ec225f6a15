//! Kapsule command line.
//!
//! Two commands: `build` packages a model described by a Modelfile as an
//! OCI image, `pull` fetches one back from a registry. Flags select the
//! sink (registry, OCI layout directory or Ollama store) and where key
//! material comes from (PEM files or a Vault transit engine).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use kapsule::builder;
use kapsule::crypto::providers::{FileProvider, KeyProvider, NullProvider, VaultProvider};
use kapsule::reader::RegistryReader;
use kapsule::writer::{ImageWriter, OllamaWriter, PathWriter, RegistryWriter};

#[derive(Parser)]
#[command(
    name = "kapsule",
    version,
    about = "Package large language models as OCI images",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build an OCI image for a model and write it to a registry or directory
    Build(BuildArgs),
    /// Pull a model image from a registry and write it locally
    Pull(PullArgs),
}

/// On-disk layout flavor for directory outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// OCI image-layout directory
    Oci,
    /// Ollama-compatible manifest/blob store
    Ollama,
}

#[derive(Args, Debug)]
struct RegistryOpts {
    /// Registry username for basic authentication
    #[arg(long, env = "KAPSULE_USERNAME")]
    username: Option<String>,

    /// Registry password for basic authentication
    #[arg(long, env = "KAPSULE_PASSWORD")]
    password: Option<String>,

    /// Skip TLS certificate verification when talking to the registry
    #[arg(long, env = "KAPSULE_INSECURE", default_value = "false")]
    insecure: bool,
}

#[derive(Args, Debug)]
struct KeyOpts {
    /// PEM public key used to encrypt the image
    #[arg(long = "public-key", env = "KAPSULE_PUBLIC_KEY")]
    public_key: Option<PathBuf>,

    /// PEM private key used to decrypt the image
    #[arg(long = "private-key", env = "KAPSULE_PRIVATE_KEY")]
    private_key: Option<PathBuf>,

    /// Vault server address, e.g. https://vault.example.com
    #[arg(long = "vault-addr", env = "KAPSULE_VAULT_ADDR")]
    vault_addr: Option<String>,

    /// Vault authentication token
    #[arg(long = "vault-token", env = "KAPSULE_VAULT_TOKEN")]
    vault_token: Option<String>,

    /// Mount path of the transit secrets engine holding the key
    #[arg(long = "vault-transit-path", env = "KAPSULE_VAULT_TRANSIT_PATH")]
    vault_transit_path: Option<String>,

    /// Name of the transit key
    #[arg(long = "vault-key", env = "KAPSULE_VAULT_KEY")]
    vault_key: Option<String>,

    /// Version of the transit key (defaults to latest)
    #[arg(long = "vault-key-version", env = "KAPSULE_VAULT_KEY_VERSION")]
    vault_key_version: Option<String>,

    /// Vault namespace (Vault Enterprise)
    #[arg(long = "vault-namespace", env = "KAPSULE_VAULT_NAMESPACE")]
    vault_namespace: Option<String>,
}

impl KeyOpts {
    fn wants_encryption(&self) -> bool {
        self.public_key.is_some() || self.vault_key.is_some()
    }

    fn wants_decryption(&self) -> bool {
        self.private_key.is_some() || self.vault_key.is_some()
    }
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Build context directory containing the model weights
    context: PathBuf,

    /// Modelfile path, resolved under the context when relative
    #[arg(
        short = 'f',
        long = "file",
        default_value = "Modelfile",
        env = "KAPSULE_MODELFILE"
    )]
    file: PathBuf,

    /// Image reference to write, e.g. registry.local/models/llama:7b
    #[arg(short = 't', long = "tag", env = "KAPSULE_TAG")]
    tag: String,

    /// Output directory; when omitted the image is pushed to the registry
    /// named by the tag
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Layout flavor for directory outputs
    #[arg(long, value_enum, default_value_t = Format::Oci)]
    format: Format,

    /// Gunzip written layer blobs in place
    #[arg(long, default_value = "false")]
    unzip: bool,

    #[command(flatten)]
    registry: RegistryOpts,

    #[command(flatten)]
    keys: KeyOpts,
}

#[derive(Args, Debug)]
struct PullArgs {
    /// Image reference to pull
    reference: String,

    /// Output directory
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Layout flavor for the output directory
    #[arg(long, value_enum, default_value_t = Format::Oci)]
    format: Format,

    /// Gunzip written layer blobs in place
    #[arg(long, default_value = "false")]
    unzip: bool,

    #[command(flatten)]
    registry: RegistryOpts,

    #[command(flatten)]
    keys: KeyOpts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(EnvFilter::new(env_filter))
        .init();

    match cli.command {
        Command::Build(args) => build(args).await,
        Command::Pull(args) => pull(args).await,
    }
}

async fn build(args: BuildArgs) -> anyhow::Result<()> {
    let modelfile = if args.file.is_absolute() {
        args.file.clone()
    } else {
        args.context.join(&args.file)
    };
    tracing::info!(
        modelfile = %modelfile.display(),
        context = %args.context.display(),
        tag = %args.tag,
        "building image"
    );

    let image = builder::build(&modelfile, &args.context)?;
    let provider = key_provider(&args.keys)?;
    let writer = select_writer(args.output.as_deref(), args.format, &args.registry, provider);

    if args.keys.wants_encryption() {
        PathWriter::reject_unzip_with_encryption(args.unzip)?;
        writer.write_encrypted(image, &args.tag).await
    } else {
        let decrypt = args.keys.wants_decryption();
        writer.write(image, &args.tag, decrypt, args.unzip).await
    }
}

async fn pull(args: PullArgs) -> anyhow::Result<()> {
    tracing::info!(reference = %args.reference, output = %args.output.display(), "pulling image");

    let reader = RegistryReader::new(
        args.registry.username.as_deref(),
        args.registry.password.as_deref(),
        args.registry.insecure,
    );
    let image = reader.pull(&args.reference).await?;

    let provider = key_provider(&args.keys)?;
    let writer = select_writer(
        Some(args.output.as_path()),
        args.format,
        &args.registry,
        provider,
    );

    let decrypt = args.keys.wants_decryption();
    writer
        .write(image, &args.reference, decrypt, args.unzip)
        .await
}

fn select_writer(
    output: Option<&std::path::Path>,
    format: Format,
    registry: &RegistryOpts,
    provider: Arc<dyn KeyProvider>,
) -> Box<dyn ImageWriter> {
    match (output, format) {
        (Some(dir), Format::Oci) => Box::new(PathWriter::new(dir, provider)),
        (Some(dir), Format::Ollama) => Box::new(OllamaWriter::new(dir, provider)),
        (None, _) => Box::new(RegistryWriter::new(
            registry.username.as_deref(),
            registry.password.as_deref(),
            registry.insecure,
            provider,
        )),
    }
}

/// Resolve the key provider from the flag set: PEM files and Vault keys
/// are mutually exclusive, Vault needs its full coordinate set, and with
/// no key flags at all the null provider is returned (its lookups fail
/// explicitly if an encryption path is ever taken).
fn key_provider(keys: &KeyOpts) -> anyhow::Result<Arc<dyn KeyProvider>> {
    let has_file_keys = keys.public_key.is_some() || keys.private_key.is_some();

    if has_file_keys && keys.vault_key.is_some() {
        bail!("cannot specify both a file based key and a vault key");
    }

    if keys.vault_key.is_some()
        && (keys.vault_addr.is_none()
            || keys.vault_token.is_none()
            || keys.vault_transit_path.is_none())
    {
        bail!("the vault address, token and transit path are required when using a vault key");
    }

    if has_file_keys {
        return Ok(Arc::new(FileProvider::new(
            keys.public_key.clone(),
            keys.private_key.clone(),
        )));
    }

    if let (Some(addr), Some(token), Some(transit), Some(key)) = (
        &keys.vault_addr,
        &keys.vault_token,
        &keys.vault_transit_path,
        &keys.vault_key,
    ) {
        return Ok(Arc::new(VaultProvider::new(
            addr,
            transit,
            key,
            keys.vault_key_version.as_deref(),
            token,
            keys.vault_namespace.as_deref(),
        )));
    }

    Ok(Arc::new(NullProvider))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_opts() -> KeyOpts {
        KeyOpts {
            public_key: None,
            private_key: None,
            vault_addr: None,
            vault_token: None,
            vault_transit_path: None,
            vault_key: None,
            vault_key_version: None,
            vault_namespace: None,
        }
    }

    #[test]
    fn no_keys_selects_the_null_provider() {
        assert!(key_provider(&key_opts()).is_ok());
    }

    #[test]
    fn file_and_vault_keys_are_mutually_exclusive() {
        let mut keys = key_opts();
        keys.public_key = Some(PathBuf::from("key.pub"));
        keys.vault_key = Some("mykey".to_string());

        assert!(key_provider(&keys).is_err());
    }

    #[test]
    fn vault_key_requires_the_full_coordinate_set() {
        let mut keys = key_opts();
        keys.vault_key = Some("mykey".to_string());
        keys.vault_addr = Some("https://vault.local".to_string());

        assert!(key_provider(&keys).is_err());

        keys.vault_token = Some("token".to_string());
        keys.vault_transit_path = Some("transit".to_string());
        assert!(key_provider(&keys).is_ok());
    }

    #[test]
    fn cli_parses_build_and_pull() {
        Cli::try_parse_from([
            "kapsule", "build", ".", "-t", "models/llama:7b", "-o", "./out", "--format", "ollama",
        ])
        .unwrap();
        Cli::try_parse_from(["kapsule", "pull", "models/llama:7b", "-o", "./out", "--unzip"])
            .unwrap();
    }
}
