use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use factura_core::{
    access_key::{self, AccessKey, AccessKeyParts, DOCUMENT_TYPE_INVOICE},
    certificate::{PasswordCipher, diagnose},
    config::Config,
    request::parse_issue_date,
    sequencer::next_sequential,
};
use secrecy::SecretString;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "factura")]
#[command(about = "SRI (Ecuador) electronic invoice tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate or verify 49-digit access keys.
    AccessKey {
        #[command(subcommand)]
        command: AccessKeyCommand,
    },
    /// Inspect PKCS#12 certificates.
    Cert {
        #[command(subcommand)]
        command: CertCommand,
    },
    /// Encrypt a certificate password for storage. Uses
    /// FACTURA_ENCRYPTION_KEY unless --key is given.
    EncryptPassword {
        password: String,
        #[arg(long)]
        key: Option<String>,
    },
    /// Decrypt a stored `iv:ciphertext` certificate password.
    DecryptPassword {
        stored: String,
        #[arg(long)]
        key: Option<String>,
    },
    /// Print the sequential that follows `current`.
    NextSequential {
        #[arg(long)]
        current: Option<String>,
    },
}

#[derive(Subcommand)]
enum AccessKeyCommand {
    Generate {
        /// Emission date, dd/mm/yyyy or yyyy-mm-dd.
        #[arg(long)]
        date: String,
        #[arg(long)]
        ruc: String,
        /// 1 = pruebas, 2 = produccion.
        #[arg(long, default_value = "1")]
        environment: String,
        /// Establishment code and emission point, e.g. 001001.
        #[arg(long)]
        series: String,
        #[arg(long)]
        sequential: String,
        /// Random when omitted.
        #[arg(long)]
        numeric_code: Option<String>,
        #[arg(long, default_value = "1")]
        emission_type: String,
        #[arg(long, default_value = DOCUMENT_TYPE_INVOICE)]
        document_type: String,
    },
    Verify {
        key: String,
    },
}

#[derive(Subcommand)]
enum CertCommand {
    Diagnose {
        path: PathBuf,
        /// Falls back to FACTURA_CERT_PASSWORD.
        #[arg(long, env = "FACTURA_CERT_PASSWORD", hide_env_values = true)]
        password: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::AccessKey { command } => match command {
            AccessKeyCommand::Generate {
                date,
                ruc,
                environment,
                series,
                sequential,
                numeric_code,
                emission_type,
                document_type,
            } => {
                let issue_date = parse_issue_date(&date)
                    .with_context(|| format!("invalid date: {date}"))?;
                let key = access_key::generate(&AccessKeyParts {
                    issue_date,
                    document_type,
                    ruc,
                    environment,
                    series,
                    sequential,
                    numeric_code: numeric_code.unwrap_or_else(access_key::random_numeric_code),
                    emission_type,
                })?;
                println!("{key}");
            }
            AccessKeyCommand::Verify { key } => {
                let key = AccessKey::parse(key)?;
                println!("{}", serde_json::to_string_pretty(&key.components())?);
            }
        },
        Commands::Cert { command } => match command {
            CertCommand::Diagnose { path, password } => {
                let report = diagnose(&path, &SecretString::from(password));
                println!("{}", serde_json::to_string_pretty(&report)?);
                if !report.password_works {
                    bail!(
                        "certificate not usable: {}",
                        report.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
        },
        Commands::EncryptPassword { password, key } => {
            let cipher = cipher(key)?;
            println!("{}", cipher.encrypt(&password));
        }
        Commands::DecryptPassword { stored, key } => {
            let cipher = cipher(key)?;
            println!("{}", cipher.decrypt(&stored)?);
        }
        Commands::NextSequential { current } => {
            println!("{}", next_sequential("cli", current.as_deref())?);
        }
    }
    Ok(())
}

fn cipher(key: Option<String>) -> Result<PasswordCipher> {
    let key = match key {
        Some(key) => key,
        None => {
            let config = Config::from_env()?;
            config
                .encryption_key()
                .map(str::to_string)
                .context("no --key given and FACTURA_ENCRYPTION_KEY is not set")?
        }
    };
    debug!("password cipher configured");
    Ok(PasswordCipher::new(&key))
}
