use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::ParseIntError;
use std::str::FromStr;
use std::time::Duration;

use clap::{builder::PossibleValue, value_parser, Arg, ArgMatches, Command, ValueEnum};
use config::{Config, File as CfgFile, FileFormat as CfgFileFormat};
use hex::FromHex;
use serde::{de, Deserialize, Deserializer};
use serde_yaml::Value;

use mixnet::core::pipeline::PipelineConfig;
use mixnet::crypto::*;

/// Config for threading.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize)]
pub enum Threads {
    /// Detect number of threads automatically by the number of CPU cores.
    Auto,
    /// Exact number of threads.
    N(u16),
}

impl FromStr for Threads {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "auto" {
            Ok(Threads::Auto)
        } else {
            u16::from_str(s).map(Threads::N)
        }
    }
}

/// Specifies where to write logs.
#[cfg(unix)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize)]
pub enum LogType {
    Stderr,
    Stdout,
    Syslog,
    None,
}

/// Specifies where to write logs.
#[cfg(not(unix))]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize)]
pub enum LogType {
    Stderr,
    Stdout,
    None,
}

impl ValueEnum for LogType {
    #[cfg(unix)]
    fn value_variants<'a>() -> &'a [Self] {
        use self::LogType::*;
        &[Stderr, Stdout, Syslog, None]
    }

    #[cfg(not(unix))]
    fn value_variants<'a>() -> &'a [Self] {
        use self::LogType::*;
        &[Stderr, Stdout, None]
    }

    fn to_possible_value<'a>(&self) -> Option<PossibleValue> {
        use self::LogType::*;
        Some(match self {
            Stderr => PossibleValue::new("Stderr"),
            Stdout => PossibleValue::new("Stdout"),
            #[cfg(unix)]
            Syslog => PossibleValue::new("Syslog"),
            None => PossibleValue::new("None"),
        })
    }
}

fn de_threads<'de, D>(deserializer: D) -> Result<Threads, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;

    Threads::from_str(&s).map_err(|e| de::Error::custom(format!("threads: {:?}", e)))
}

/// Config parsed from command line arguments.
#[derive(Clone, Debug, Deserialize)]
pub struct NodeConfig {
    /// TCP address the relay listens on.
    #[serde(rename = "listen-address")]
    pub listen_addr: SocketAddr,
    /// Relay SecretKey
    #[serde(skip_deserializing)]
    pub sk: Option<SecretKey>,
    /// True if the SecretKey was passed as an argument instead of environment
    /// variable. Necessary to print a warning since the logger backend is not
    /// initialized when we parse arguments.
    #[serde(skip_deserializing)]
    pub sk_passed_as_arg: bool,
    /// Path to the file where relay keys are stored.
    /// Required with config.
    #[serde(rename = "keys-file")]
    pub keys_file: Option<String>,
    /// Number of threads for execution.
    #[serde(deserialize_with = "de_threads")]
    pub threads: Threads,
    /// Specifies where to write logs.
    #[serde(rename = "log-type")]
    pub log_type: LogType,
    /// Mean of the per-packet forwarding delay in milliseconds.
    #[serde(rename = "delay-mean-ms")]
    pub delay_mean_ms: u64,
    /// Upper clamp of the per-packet forwarding delay in milliseconds.
    #[serde(rename = "delay-max-ms")]
    pub delay_max_ms: u64,
    /// Number of jobs the pipeline groups into one batch.
    #[serde(rename = "batch-size")]
    pub batch_size: usize,
    /// Number of pipeline worker tasks.
    pub workers: usize,
    /// Unused fields while parsing config file
    #[serde(flatten)]
    pub unused: HashMap<String, Value>,
}

impl NodeConfig {
    /// Pipeline tunables from the config, defaults for the rest.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            batch_size: self.batch_size,
            workers: self.workers,
            ..PipelineConfig::default()
        }
    }

    /// Mean forwarding delay as a `Duration`.
    pub fn delay_mean(&self) -> Duration {
        Duration::from_millis(self.delay_mean_ms)
    }

    /// Maximum forwarding delay as a `Duration`.
    pub fn delay_max(&self) -> Duration {
        Duration::from_millis(self.delay_max_ms)
    }
}

fn create_sk_arg() -> Arg {
    Arg::new("secret-key")
        .short('s')
        .long("secret-key")
        .help(
            "Relay secret key. Note that you should not pass the key via \
             arguments due to security reasons. Use this argument for \
             test purposes only. In the real world use the environment \
             variable instead",
        )
        .num_args(1)
        .conflicts_with("keys-file")
        .env("MIXNET_SECRET_KEY")
        .hide(true)
}

fn create_keys_file_arg() -> Arg {
    Arg::new("keys-file")
        .short('k')
        .long("keys-file")
        .help("Path to the file where relay keys are stored")
        .num_args(1)
        .required_unless_present("secret-key")
        .conflicts_with("secret-key")
}

fn app() -> Command {
    Command::new(clap::crate_name!())
        .version(clap::crate_version!())
        .about(clap::crate_description!())
        .args_conflicts_with_subcommands(true)
        .subcommand(Command::new("config")
            .arg(Arg::new("cfg-file")
                .index(1)
                .help("Load settings from saved config file. \
                    Config file format is YAML")
                .num_args(1)
                .required(true)))
        .subcommand(Command::new("derive-pk")
            .about("Derive PK from either --keys-file or from env:MIXNET_SECRET_KEY")
            .arg(create_sk_arg())
            .arg(create_keys_file_arg()))
        // here go args without subcommands
        .arg(create_sk_arg())
        .arg(create_keys_file_arg())
        .arg(Arg::new("listen-address")
            .short('a')
            .long("listen-address")
            .help("TCP address the relay listens on")
            .num_args(1)
            .value_parser(value_parser!(SocketAddr))
            .required(true))
        .arg(Arg::new("threads")
            .short('j')
            .long("threads")
            .help("Number of threads to use. The value 'auto' means that the \
                   number of threads will be determined automatically by the \
                   number of CPU cores")
            .num_args(1)
            .value_parser(value_parser!(Threads))
            .default_value("1"))
        .arg(Arg::new("log-type")
            .short('l')
            .long("log-type")
            .help("Where to write logs")
            .num_args(1)
            .value_parser(value_parser!(LogType))
            .default_value("Stderr"))
        .arg(Arg::new("delay-mean-ms")
            .long("delay-mean-ms")
            .help("Mean of the per-packet forwarding delay in milliseconds")
            .num_args(1)
            .value_parser(value_parser!(u64))
            .default_value("50"))
        .arg(Arg::new("delay-max-ms")
            .long("delay-max-ms")
            .help("Upper clamp of the per-packet forwarding delay in \
                   milliseconds")
            .num_args(1)
            .value_parser(value_parser!(u64))
            .default_value("1000"))
        .arg(Arg::new("batch-size")
            .long("batch-size")
            .help("Number of jobs the pipeline groups into one batch")
            .num_args(1)
            .value_parser(value_parser!(usize))
            .default_value("32"))
        .arg(Arg::new("workers")
            .short('w')
            .long("workers")
            .help("Number of pipeline worker tasks")
            .num_args(1)
            .value_parser(value_parser!(usize))
            .default_value("4"))
}

/// Parse command line arguments.
pub fn cli_parse() -> NodeConfig {
    let matches = app().get_matches();

    match matches.subcommand() {
        Some(("derive-pk", m)) => run_derive_pk(m),
        Some(("config", m)) => run_config(m),
        _ => run_args(&matches),
    }
}

/// Parse settings from a saved file.
fn parse_config(config_path: &str) -> NodeConfig {
    let config_builder = Config::builder()
        .set_default("log-type", "Stderr").expect("Can't set default value for `log-type`")
        .set_default("threads", "1").expect("Can't set default value for `threads`")
        .set_default("delay-mean-ms", "50").expect("Can't set default value for `delay-mean-ms`")
        .set_default("delay-max-ms", "1000").expect("Can't set default value for `delay-max-ms`")
        .set_default("batch-size", "32").expect("Can't set default value for `batch-size`")
        .set_default("workers", "4").expect("Can't set default value for `workers`")
        .add_source(CfgFile::new(config_path, CfgFileFormat::Yaml));

    let config_file = match config_builder.build() {
        Ok(cfg) => cfg,
        Err(e) => panic!("Can't build config file {}", e),
    };

    let config: NodeConfig = config_file.try_deserialize().expect("Can't deserialize config");

    if config.keys_file.is_none() {
        panic!("Can't deserialize config: 'keys-file' is not set");
    }

    config
}

fn run_derive_pk(matches: &ArgMatches) -> ! {
    let sk_passed_as_arg = matches.contains_id("secret-key");
    if sk_passed_as_arg {
        panic!(
            "You should not pass the secret key via arguments due to \
             security reasons. Use the environment variable instead"
        );
    }

    let pk_from_arg = matches.get_one::<String>("secret-key").map(|s| {
        let sk_bytes: [u8; 32] = FromHex::from_hex(s).expect("Invalid relay secret key");
        SecretKey::from(sk_bytes).public_key()
    });
    let pk_from_file = matches.get_one::<String>("keys-file").map(|keys_file| {
        let mut file = std::fs::File::open(keys_file).expect("Failed to read the keys file");

        let mut buf = [0; crypto_box::KEY_SIZE * 2];
        use std::io::Read;
        file.read_exact(&mut buf).expect("Failed to read keys from the keys file");
        let pk_bytes: [u8; crypto_box::KEY_SIZE] = buf[..crypto_box::KEY_SIZE].try_into().expect("Failed to read public key from the keys file");
        let sk_bytes: [u8; crypto_box::KEY_SIZE] = buf[crypto_box::KEY_SIZE..].try_into().expect("Failed to read secret key from the keys file");
        let pk = PublicKey::from(pk_bytes);
        let sk = SecretKey::from(sk_bytes);
        assert!(pk == sk.public_key(), "The loaded public key does not correspond to the loaded secret key");
        pk
    });

    let pk = pk_from_arg.or(pk_from_file).unwrap();

    println!("{}", hex::encode(pk.as_bytes()).to_uppercase());

    std::process::exit(0)
}

fn run_config(matches: &ArgMatches) -> NodeConfig {
    let config_path = matches.get_one::<String>("cfg-file").unwrap();

    parse_config(config_path)
}

fn run_args(matches: &ArgMatches) -> NodeConfig {
    let listen_addr = matches
        .get_one::<SocketAddr>("listen-address")
        .copied()
        .unwrap();

    let sk = matches.get_one::<String>("secret-key").map(|s| {
        let sk_bytes: [u8; 32] = FromHex::from_hex(s).expect("Invalid relay secret key");
        SecretKey::from(sk_bytes)
    });

    let sk_passed_as_arg = matches.contains_id("secret-key");

    let keys_file = matches.get_one("keys-file").cloned();

    let threads = matches.get_one("threads").copied().unwrap();

    let log_type = matches.get_one("log-type").copied().unwrap();

    let delay_mean_ms = matches.get_one("delay-mean-ms").copied().unwrap();

    let delay_max_ms = matches.get_one("delay-max-ms").copied().unwrap();

    let batch_size = matches.get_one("batch-size").copied().unwrap();

    let workers = matches.get_one("workers").copied().unwrap();

    NodeConfig {
        listen_addr,
        sk,
        sk_passed_as_arg,
        keys_file,
        threads,
        log_type,
        delay_mean_ms,
        delay_max_ms,
        batch_size,
        workers,
        unused: HashMap::new(),
    }
}
