use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{error, info};
use std::{env, fs, sync::Arc};
use umbra_common::{config::VERSION, crypto::PublicKey, utils::format_native};
use umbra_mixer::{
    cipher::Cipher,
    config::{
        MixConfig, DEFAULT_GROWTH_STEP, ENV_DATABASE_URL, ENV_ENCRYPTION_SECRET, ENV_RPC_ENDPOINT,
    },
    gateway::{HttpLedger, RpcGateway},
    pool::WalletPool,
    MixRequest, Mixer,
};

#[derive(Parser)]
#[clap(version = VERSION, about = "Umbra mixer - disperse value through hop wallets")]
pub struct Config {
    /// JSON-RPC endpoint of the ledger
    #[clap(long)]
    pub rpc_endpoint: Option<String>,
    /// Path of the wallet pool store
    #[clap(long)]
    pub db_path: Option<String>,
    /// Address receiving funds swept during recovery
    #[clap(long)]
    pub salvage_address: Option<PublicKey>,
    /// Read the encryption secret from this file instead of the
    /// environment
    #[clap(long)]
    pub encryption_secret_file: Option<String>,
    /// JSON file to load the mix configuration from
    #[clap(long)]
    pub config_file: Option<String>,
    /// Generate the template at the `config_file` path
    #[clap(long)]
    pub generate_config_template: bool,
    /// Command to execute: "stats", "seed_pool <count>" or
    /// "mix <request.json>"
    #[clap(long)]
    pub exec: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let config = Config::parse();

    if config.generate_config_template {
        let path = config
            .config_file
            .as_deref()
            .ok_or_else(|| anyhow!("--config-file is required to generate a template"))?;
        let template = serde_json::to_string_pretty(&MixConfig::default())?;
        fs::write(path, template)?;
        info!("configuration template written to {}", path);
        return Ok(());
    }

    let mix_config = match config.config_file.as_deref() {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Error while reading config file {}", path))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Error while parsing config file {}", path))?
        }
        None => MixConfig::default(),
    };

    let exec = config
        .exec
        .as_deref()
        .ok_or_else(|| anyhow!("nothing to do, pass --exec (stats | seed_pool <n> | mix <file>)"))?
        .to_owned();

    let secret = read_encryption_secret(&config)?;
    let cipher = Arc::new(Cipher::new(secret.as_bytes())?);

    let db_path = config
        .db_path
        .clone()
        .or_else(|| env::var(ENV_DATABASE_URL).ok())
        .ok_or_else(|| anyhow!("no database path, set --db-path or {}", ENV_DATABASE_URL))?;
    let pool = Arc::new(WalletPool::open(&db_path, cipher, DEFAULT_GROWTH_STEP)?);

    let mut parts = exec.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let argument = parts.next();

    match command {
        "stats" => {
            let stats = pool.stats()?;
            println!("{}", stats);
        }
        "seed_pool" => {
            let target: usize = argument
                .ok_or_else(|| anyhow!("seed_pool needs a wallet count"))?
                .parse()
                .context("invalid wallet count")?;
            let mut generated = 0;
            loop {
                let batch = pool.ensure_health(target)?;
                if batch == 0 {
                    break;
                }
                generated += batch;
            }
            pool.flush().await?;
            info!("generated {} wallets", generated);
            println!("{}", pool.stats()?);
        }
        "mix" => {
            let path = argument.ok_or_else(|| anyhow!("mix needs a request file"))?;
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Error while reading request file {}", path))?;
            let request: MixRequest = serde_json::from_str(&raw)
                .with_context(|| format!("Error while parsing request file {}", path))?;

            let endpoint = config
                .rpc_endpoint
                .clone()
                .or_else(|| env::var(ENV_RPC_ENDPOINT).ok())
                .ok_or_else(|| {
                    anyhow!("no RPC endpoint, set --rpc-endpoint or {}", ENV_RPC_ENDPOINT)
                })?;
            let ledger = Arc::new(HttpLedger::new(endpoint)?);
            let gateway = Arc::new(RpcGateway::new(ledger, &mix_config.rpc_limits));
            let mixer = Mixer::new(Arc::clone(&pool), gateway, config.salvage_address);

            let total = request.total_amount;
            let result = mixer.run_mix(request, mix_config).await?;

            pool.flush().await?;
            info!(
                "mixed {} across {} routes in {} ms (ok: {})",
                format_native(total),
                result.routes.len(),
                result.duration_ms,
                result.aggregate_ok
            );
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.aggregate_ok {
                error!("some routes failed, inspect the report above");
                std::process::exit(1);
            }
        }
        other => return Err(anyhow!("unknown command '{}'", other)),
    }

    Ok(())
}

fn read_encryption_secret(config: &Config) -> Result<String> {
    if let Some(path) = config.encryption_secret_file.as_deref() {
        let secret = fs::read_to_string(path)
            .with_context(|| format!("Error while reading secret file {}", path))?;
        return Ok(secret.trim_end().to_owned());
    }

    env::var(ENV_ENCRYPTION_SECRET).map_err(|_| {
        anyhow!(
            "no encryption secret, set {} or --encryption-secret-file",
            ENV_ENCRYPTION_SECRET
        )
    })
}
