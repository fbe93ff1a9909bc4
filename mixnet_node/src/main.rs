#[macro_use]
extern crate log;

mod node_config;

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Error;
use ed25519_dalek::SigningKey;
use futures::{Future, SinkExt, StreamExt};
use rand::thread_rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
#[cfg(unix)]
use syslog::Facility;

use mixnet::core::bridge::open_envelope;
use mixnet::core::circuit::{CircuitRegistry, LinkTable};
use mixnet::core::delay::DelayScheduler;
use mixnet::core::pipeline::Pipeline;
use mixnet::core::replay::{ReplayGuard, REPLAY_WINDOW};
use mixnet::core::stats::Stats;
use mixnet::core::time::unix_time;
use mixnet::core::transport::{ConnectionPool, DelaySender, FrameCodec, PoolConfig};
use mixnet::crypto::*;
use mixnet::packet::packet::Packet;

use crate::node_config::*;

/// Channel size for payloads delivered at this node.
const DELIVERY_CHANNEL_SIZE: usize = 32;
/// How often expired links are purged from the link table.
const LINK_PURGE_INTERVAL: Duration = Duration::from_secs(60);
/// How often the engine counters are logged.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

const VRF_KEY_CONTEXT: &str = "mixnet v1 delay vrf";

/// Save relay keys to a binary file.
fn save_keys(keys_file: &str, pk: PublicKey, sk: &SecretKey) {
    #[cfg(unix)]
    use std::os::unix::fs::OpenOptionsExt;

    #[cfg(not(unix))]
    let mut file = File::create(keys_file).expect("Failed to create the keys file");

    #[cfg(unix)]
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .mode(0o600)
        .open(keys_file)
        .expect("Failed to create the keys file");

    file.write_all(pk.as_bytes()).expect("Failed to save public key to the keys file");
    file.write_all(sk.as_bytes()).expect("Failed to save secret key to the keys file");
}

/// Load relay keys from a binary file.
fn load_keys(mut file: File) -> (PublicKey, SecretKey) {
    let mut buf = [0; crypto_box::KEY_SIZE * 2];
    file.read_exact(&mut buf).expect("Failed to read keys from the keys file");
    let pk_bytes: [u8; crypto_box::KEY_SIZE] = buf[..crypto_box::KEY_SIZE].try_into().expect("Failed to read public key from the keys file");
    let sk_bytes: [u8; crypto_box::KEY_SIZE] = buf[crypto_box::KEY_SIZE..].try_into().expect("Failed to read secret key from the keys file");
    let pk = PublicKey::from(pk_bytes);
    let sk = SecretKey::from(sk_bytes);
    assert!(pk == sk.public_key(), "The loaded public key does not correspond to the loaded secret key");
    (pk, sk)
}

/// Load relay keys from a binary file or generate and save them if file does
/// not exist.
fn load_or_gen_keys(keys_file: &str) -> (PublicKey, SecretKey) {
    match File::open(keys_file) {
        Ok(file) => load_keys(file),
        Err(ref e) if e.kind() == ErrorKind::NotFound => {
            info!("Generating new relay keys and storing them to '{}'", keys_file);
            let sk = SecretKey::generate(&mut thread_rng());
            let pk = sk.public_key();
            save_keys(keys_file, pk.clone(), &sk);
            (pk, sk)
        },
        Err(e) => panic!("Failed to read the keys file: {}", e)
    }
}

/// Delay VRF signing key derived from the relay's long-term secret, so
/// one keys file carries both identities.
fn vrf_signing_key(sk: &SecretKey) -> SigningKey {
    SigningKey::from_bytes(&blake3::derive_key(VRF_KEY_CONTEXT, &sk.to_bytes()))
}

/// Run a future with the runtime specified by config.
fn run<F>(future: F, threads: Threads)
    where F: Future<Output = Result<(), Error>> + 'static
{
    if threads == Threads::N(1) {
        let runtime = runtime::Runtime::new().expect("Failed to create runtime");
        runtime.block_on(future).expect("Execution was terminated with error");
    } else {
        let mut builder = runtime::Builder::new_multi_thread();
        match threads {
            Threads::N(n) => { builder.worker_threads(n as usize); },
            Threads::Auto => { }, // builder will detect number of cores automatically
        }
        let runtime = builder
            .build()
            .expect("Failed to create runtime");
        runtime.block_on(future).expect("Execution was terminated with error");
    };
}

/// Serve one inbound link: answer circuit requests, feed mix packets to
/// the pipeline.
async fn handle_connection(
    stream: TcpStream,
    links: Arc<LinkTable>,
    pipeline: Pipeline,
    sk: SecretKey,
    stats: Stats,
) -> Result<(), Error> {
    let mut framed = Framed::new(stream, FrameCodec::new(stats));
    while let Some(packet) = framed.next().await {
        match packet? {
            Packet::Mix(packet) => {
                if let Err(error) = pipeline.submit_inbound(packet) {
                    warn!("Dropping inbound packet: {}", error);
                }
            },
            Packet::CircuitRequest(request) => match links.accept(&request, &sk) {
                Ok(response) => framed.send(Packet::CircuitResponse(response)).await?,
                Err(error) => warn!("Rejecting circuit request: {}", error),
            },
            Packet::CircuitResponse(_) => warn!("Unexpected circuit response on inbound link"),
        }
    }
    Ok(())
}

/// Accept inbound links and serve each on its own task.
async fn run_listener(
    listener: TcpListener,
    links: Arc<LinkTable>,
    pipeline: Pipeline,
    sk: SecretKey,
    stats: Stats,
) -> Result<(), Error> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let links = links.clone();
        let pipeline = pipeline.clone();
        let sk = sk.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            if let Err(error) = handle_connection(stream, links, pipeline, sk, stats).await {
                debug!("Connection from {} closed: {}", peer_addr, error);
            }
        });
    }
}

async fn run_relay(config: &NodeConfig, sk: SecretKey) -> Result<(), Error> {
    let stats = Stats::new();
    let links = Arc::new(LinkTable::new());
    let replay = Arc::new(ReplayGuard::new(REPLAY_WINDOW));
    let delay = Arc::new(DelayScheduler::with_params(
        vrf_signing_key(&sk),
        config.delay_mean(),
        config.delay_max(),
    ));
    let pool = Arc::new(ConnectionPool::new(PoolConfig::default(), stats.clone()));
    let (delivery_tx, mut delivery_rx) = mpsc::channel(DELIVERY_CHANNEL_SIZE);
    let sink = Arc::new(DelaySender::new(pool, delivery_tx, stats.clone()));
    let pipeline = Pipeline::run(
        config.pipeline_config(),
        CircuitRegistry::new(),
        links.clone(),
        replay,
        delay,
        sink,
        stats.clone(),
    );

    let links_c = links.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(LINK_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            links_c.purge_expired(unix_time(SystemTime::now()));
        }
    });

    let pipeline_c = pipeline.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_LOG_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let snapshot = pipeline_c.stats();
            info!(
                "Processed {} packets ({:.1} pps, {:.2} ms avg), dropped {}, \
                 replays {}, integrity rejects {}",
                snapshot.packets_processed,
                snapshot.throughput_pps,
                snapshot.avg_latency_ms,
                snapshot.packets_dropped,
                snapshot.replays_rejected,
                snapshot.integrity_rejected,
            );
        }
    });

    let delivery_future = async move {
        while let Some(payload) = delivery_rx.recv().await {
            match open_envelope(&payload) {
                Some((target, body)) => {
                    info!("Delivered {} bytes addressed to {}", body.len(), target)
                },
                None => warn!("Delivered payload with a malformed envelope"),
            }
        }

        Ok(())
    };

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("Running mixnet relay on {}", config.listen_addr);

    futures::try_join!(
        run_listener(listener, links, pipeline, sk, stats),
        delivery_future
    )?;

    Ok(())
}

fn main() {
    let config = cli_parse();

    match config.log_type {
        LogType::Stderr => {
            let env = env_logger::Env::default()
                .filter_or("RUST_LOG", "info");
            env_logger::Builder::from_env(env)
                .init();
        },
        LogType::Stdout => {
            let env = env_logger::Env::default()
                .filter_or("RUST_LOG", "info");
            env_logger::Builder::from_env(env)
                .target(env_logger::fmt::Target::Stdout)
                .init();
        },
        #[cfg(unix)]
        LogType::Syslog => {
            syslog::init(Facility::LOG_USER, log::LevelFilter::Info, None)
                .expect("Failed to initialize syslog backend.");
        },
        LogType::None => { },
    }

    for key in config.unused.keys() {
        warn!("Unused configuration key: {:?}", key);
    }

    let (pk, sk) = if let Some(ref sk) = config.sk {
        (sk.public_key(), sk.clone())
    } else if let Some(ref keys_file) = config.keys_file {
        load_or_gen_keys(keys_file)
    } else {
        panic!("Neither secret key nor keys file is specified")
    };

    if config.sk_passed_as_arg {
        warn!("You should not pass the secret key via arguments due to \
               security reasons. Use the environment variable instead");
    }

    info!("Relay public key: {}", hex::encode(pk.as_bytes()).to_uppercase());
    info!(
        "Delay VRF public key: {}",
        hex::encode(vrf_signing_key(&sk).verifying_key().as_bytes()).to_uppercase()
    );

    let threads = config.threads;
    let future = async move { run_relay(&config, sk).await };

    run(future, threads);
}
