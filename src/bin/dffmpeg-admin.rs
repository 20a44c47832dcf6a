//! Admin CLI: identity management and key rotation against the coordinator
//! database. Exit codes: 0 success, 2 user error, 1 operational error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use ipnet::IpNet;

use dffmpeg_coordinator::admin::{
    list_identities, put_identity, remove_identity, rotate_keys,
};
use dffmpeg_coordinator::auth::{KeyRing, RequestSigner};
use dffmpeg_coordinator::config::{self, DatabaseEngine};
use dffmpeg_coordinator::model::Role;
use dffmpeg_coordinator::repo::{MemoryRepository, Repository, SqliteRepository};

const EXIT_USER_ERROR: u8 = 2;
const EXIT_OPERATIONAL_ERROR: u8 = 1;

#[derive(Parser, Debug)]
#[command(name = "dffmpeg-admin")]
#[command(about = "Administer dffmpeg coordinator identities and keys")]
struct Args {
    /// Coordinator config file (database location and key ring)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or replace an identity
    IdentityAdd {
        #[arg(long)]
        client_id: String,
        /// client, worker, or admin
        #[arg(long)]
        role: String,
        /// Base64 HMAC key; generated and printed when omitted
        #[arg(long)]
        key: Option<String>,
        /// Allowed source CIDR; repeatable. Defaults to open access.
        #[arg(long = "cidr")]
        cidrs: Vec<String>,
        /// Store an empty CIDR set (deny all requests)
        #[arg(long)]
        deny_all: bool,
    },
    /// List identities
    IdentityList,
    /// Delete an identity
    IdentityRemove {
        #[arg(long)]
        client_id: String,
    },
    /// Print a fresh base64 HMAC key
    GenerateKey,
    /// Print a fresh key-ring entry for the config file
    GenerateRingKey,
    /// Re-encrypt stored HMAC keys under a ring key
    RotateKeys {
        /// Target ring key id; omit with --decrypt to strip encryption
        #[arg(long)]
        key_id: Option<String>,
        /// Decrypt to plaintext instead of re-encrypting
        #[arg(long)]
        decrypt: bool,
        /// Maximum identities to process
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_OPERATIONAL_ERROR);
        }
    };

    let repo = match config.database.engine {
        DatabaseEngine::Memory => Repository::Memory(MemoryRepository::new()),
        DatabaseEngine::Sqlite => {
            match SqliteRepository::open(&config.database.path, config.database.tables.clone()) {
                Ok(repo) => Repository::Sqlite(repo),
                Err(e) => {
                    eprintln!("could not open database: {e}");
                    return ExitCode::from(EXIT_OPERATIONAL_ERROR);
                }
            }
        }
    };
    let keyring = match KeyRing::from_config(
        &config.auth.encryption_keys,
        config.auth.default_key_id.clone(),
    ) {
        Ok(keyring) => keyring,
        Err(e) => {
            eprintln!("key ring error: {e}");
            return ExitCode::from(EXIT_OPERATIONAL_ERROR);
        }
    };

    match args.command {
        Command::IdentityAdd {
            client_id,
            role,
            key,
            cidrs,
            deny_all,
        } => {
            let Some(role) = Role::parse(&role) else {
                eprintln!("invalid role {role:?}: expected client, worker, or admin");
                return ExitCode::from(EXIT_USER_ERROR);
            };
            let mut parsed_cidrs = Vec::with_capacity(cidrs.len());
            for raw in &cidrs {
                match raw.parse::<IpNet>() {
                    Ok(net) => parsed_cidrs.push(net),
                    Err(e) => {
                        eprintln!("invalid CIDR {raw:?}: {e}");
                        return ExitCode::from(EXIT_USER_ERROR);
                    }
                }
            }
            let (key, generated) = match key {
                Some(key) => (key, false),
                None => (RequestSigner::generate_key(), true),
            };

            match put_identity(
                &repo,
                &keyring,
                &client_id,
                role,
                &key,
                parsed_cidrs,
                deny_all,
            )
            .await
            {
                Ok(()) => {
                    println!("identity {client_id} stored");
                    if generated {
                        println!("hmac key: {key}");
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("failed to store identity: {e}");
                    ExitCode::from(EXIT_OPERATIONAL_ERROR)
                }
            }
        }
        Command::IdentityList => match list_identities(&repo).await {
            Ok(identities) => {
                for identity in identities {
                    let cidrs: Vec<String> = identity
                        .allowed_cidrs
                        .iter()
                        .map(|net| net.to_string())
                        .collect();
                    println!(
                        "{}\t{}\tkey_id={}\tcidrs={}",
                        identity.client_id,
                        identity.role.as_str(),
                        identity.key_id.as_deref().unwrap_or("-"),
                        cidrs.join(",")
                    );
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("failed to list identities: {e}");
                ExitCode::from(EXIT_OPERATIONAL_ERROR)
            }
        },
        Command::IdentityRemove { client_id } => match remove_identity(&repo, &client_id).await {
            Ok(true) => {
                println!("identity {client_id} removed");
                ExitCode::SUCCESS
            }
            Ok(false) => {
                eprintln!("no such identity: {client_id}");
                ExitCode::from(EXIT_USER_ERROR)
            }
            Err(e) => {
                eprintln!("failed to remove identity: {e}");
                ExitCode::from(EXIT_OPERATIONAL_ERROR)
            }
        },
        Command::GenerateKey => {
            println!("{}", RequestSigner::generate_key());
            ExitCode::SUCCESS
        }
        Command::GenerateRingKey => {
            println!("{}", KeyRing::generate_entry());
            ExitCode::SUCCESS
        }
        Command::RotateKeys {
            key_id,
            decrypt,
            limit,
            batch_size,
        } => {
            let target = match (&key_id, decrypt) {
                (Some(_), true) => {
                    eprintln!("--key-id and --decrypt are mutually exclusive");
                    return ExitCode::from(EXIT_USER_ERROR);
                }
                (None, false) => match keyring.default_key_id() {
                    Some(default) => Some(default.to_string()),
                    None => {
                        eprintln!("no --key-id given and the ring has no default key");
                        return ExitCode::from(EXIT_USER_ERROR);
                    }
                },
                (Some(id), false) => Some(id.clone()),
                (None, true) => None,
            };

            match rotate_keys(&repo, &keyring, target.as_deref(), limit, batch_size).await {
                Ok(report) => {
                    println!(
                        "scanned {} identities: {} re-encrypted, {} failed",
                        report.scanned, report.reencrypted, report.failed
                    );
                    if report.failed > 0 {
                        ExitCode::from(EXIT_OPERATIONAL_ERROR)
                    } else {
                        ExitCode::SUCCESS
                    }
                }
                Err(e) => {
                    eprintln!("rotation failed: {e}");
                    ExitCode::from(EXIT_OPERATIONAL_ERROR)
                }
            }
        }
    }
}
