use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ddxp::{
    agreement::AgreementTerms,
    config::create_default_config_file,
    template::Registration,
    Account, Address, AppConfig, Bytes32, DdxpClient, Ddo, Did,
};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ddxp")]
#[command(about = "Resolve data assets and run service agreements")]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Use an in-process chain instead of the configured node.
    #[arg(long)]
    memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a DID and print its DDO
    Resolve { did: String },
    /// Full-text search over published assets
    Search { text: String },
    /// Token balance of an address
    Balance { address: String },
    /// Register the escrow access template
    RegisterTemplate {
        #[arg(long, env = "DDXP_OWNER_KEY")]
        owner_key: String,
    },
    /// Order an asset, acting as both consumer and publisher
    Order {
        #[arg(long)]
        did: String,
        #[arg(long, default_value = "0")]
        service: String,
        #[arg(long, env = "DDXP_CONSUMER_KEY")]
        consumer_key: String,
        #[arg(long, env = "DDXP_PUBLISHER_KEY")]
        publisher_key: String,
    },
    /// Compute the agreement hash for a DDO access service without touching the chain
    HashAgreement {
        #[arg(long)]
        ddo: PathBuf,
        #[arg(long, default_value = "0")]
        service: String,
        #[arg(long)]
        agreement_id: String,
        #[arg(long)]
        consumer: String,
    },
    /// Write a default configuration file
    InitConfig { path: PathBuf },
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return AppConfig::load_with_env_overrides(path)
            .with_context(|| format!("loading {}", path.display()));
    }
    let mut config = AppConfig::default();
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.is_json_logging() {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(feature = "dev-chain")]
fn in_memory_client(config: AppConfig) -> anyhow::Result<DdxpClient> {
    Ok(DdxpClient::in_memory(config)?.0)
}

#[cfg(not(feature = "dev-chain"))]
fn in_memory_client(_config: AppConfig) -> anyhow::Result<DdxpClient> {
    bail!("--memory needs a build with the dev-chain feature")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Command::InitConfig { path } = &args.command {
        create_default_config_file(path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let config = load_config(&args.config)?;
    init_logging(&config);

    let client = if args.memory {
        in_memory_client(config)?
    } else {
        DdxpClient::new(config)?
    };

    match args.command {
        Command::Resolve { did } => {
            let did = Did::parse(&did)?;
            let ddo = client.assets().resolve(&did).await?;
            println!("{}", ddo.to_json()?);
        }
        Command::Search { text } => {
            let results = client.assets().search(&text).await?;
            println!("Found {} assets", results.len());
            for ddo in results {
                let name = ddo.metadata().map(|m| m.base.name.as_str()).unwrap_or("<unnamed>");
                println!("  {}  {}", ddo.id, name);
            }
        }
        Command::Balance { address } => {
            let address: Address = address.parse()?;
            let balance = client.keeper().token().balance_of(&address).await?;
            println!("{}", balance);
        }
        Command::RegisterTemplate { owner_key } => {
            let owner = Account::from_private_key(&owner_key)?;
            match client.register_template(&owner).await? {
                Registration::Registered(receipt) => {
                    println!("Template registered in {}", receipt.transaction_hash)
                }
                Registration::AlreadyRegistered => println!("Template already registered by {}", owner.address()),
            }
        }
        Command::Order {
            did,
            service,
            consumer_key,
            publisher_key,
        } => {
            let did = Did::parse(&did)?;
            let consumer = Account::from_private_key(&consumer_key)?;
            let publisher = Account::from_private_key(&publisher_key)?;
            let agreement = client.assets().order(&did, &service, &consumer, &publisher).await?;
            info!(agreement = %agreement.id(), state = %agreement.state, "Order finished");
            println!("Agreement {} is {}", agreement.id(), agreement.state);
        }
        Command::HashAgreement {
            ddo,
            service,
            agreement_id,
            consumer,
        } => {
            let json = std::fs::read_to_string(&ddo).with_context(|| format!("reading {}", ddo.display()))?;
            let ddo = Ddo::from_json(&json)?;
            let agreement_id: Bytes32 = agreement_id.parse()?;
            let consumer: Address = consumer.parse()?;
            let access = ddo.access_service(&service)?;
            let terms = AgreementTerms::from_access_service(
                agreement_id,
                ddo.id,
                access,
                consumer,
                client.keeper().chain().as_ref(),
            )?;
            for condition in &terms.conditions {
                println!("{:<20} {}", condition.name, condition.condition_id);
            }
            println!("{:<20} {}", "agreement hash", terms.hash());
        }
        Command::InitConfig { .. } => bail!("handled above"),
    }

    Ok(())
}
