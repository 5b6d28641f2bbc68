use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use eid_pace::iso7816::commands::read_card_access;
use eid_pace::iso7816::pcsc_transport::{PcscTransport, TransportConfig};
use eid_pace::iso7816::transport::Transport;
use eid_pace::logging::hexdump;
use eid_pace::pace::{self, Config};
use eid_pace::pace::mapping::Mapping;
use eid_pace::pace::oids;
use eid_pace::pace::password::PasswordSource;
use pcsc::ShareMode;
use rasn::types::Oid;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;


#[derive(Parser)]
#[command(name = "eid-tool", version, about = "Establishes PACE with a contact eID card")]
struct Args {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Lists the connected PC/SC readers.
    ListReaders,

    /// Shows the reader, protocol and ATR of the inserted card.
    Status(ReaderOpts),

    /// Runs PACE and reads EF.CardAccess through the secure channel.
    Establish(EstablishOpts),
}

#[derive(Clone, Debug, Default, clap::Args)]
struct ReaderOpts {
    /// Index of the reader, as shown by list-readers.
    #[arg(short, long = "reader")]
    pub reader_index: Option<usize>,

    /// Substring of the reader name; used if no index is given.
    #[arg(short = 'n', long)]
    pub reader_name: Option<String>,

    /// Seconds to wait for a card to be inserted.
    #[arg(short, long)]
    pub wait: Option<u64>,

    /// Keep other applications from accessing the card meanwhile.
    #[arg(short = 'x', long)]
    pub exclusive: bool,
}
impl ReaderOpts {
    fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            reader_index: self.reader_index,
            reader_name: self.reader_name.clone(),
            card_wait_timeout: self.wait.map(Duration::from_secs),
            share_mode: if self.exclusive { ShareMode::Exclusive } else { ShareMode::Shared },
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum SourceArg {
    Mrz,
    Can,
    Pin,
    Puk,
}
impl From<SourceArg> for PasswordSource {
    fn from(value: SourceArg) -> Self {
        match value {
            SourceArg::Mrz => PasswordSource::Mrz,
            SourceArg::Can => PasswordSource::Can,
            SourceArg::Pin => PasswordSource::Pin,
            SourceArg::Puk => PasswordSource::Puk,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum MappingArg {
    Gm,
    Im,
}
impl From<MappingArg> for Mapping {
    fn from(value: MappingArg) -> Self {
        match value {
            MappingArg::Gm => Mapping::Generic,
            MappingArg::Im => Mapping::Integrated,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum ProtocolArg {
    GmAes128,
    GmAes192,
    GmAes256,
    ImAes128,
    ImAes192,
    ImAes256,
}
impl ProtocolArg {
    fn oid(&self) -> &'static Oid {
        match self {
            Self::GmAes128 => oids::PACE_ECDH_GM_AES_CBC_CMAC_128,
            Self::GmAes192 => oids::PACE_ECDH_GM_AES_CBC_CMAC_192,
            Self::GmAes256 => oids::PACE_ECDH_GM_AES_CBC_CMAC_256,
            Self::ImAes128 => oids::PACE_ECDH_IM_AES_CBC_CMAC_128,
            Self::ImAes192 => oids::PACE_ECDH_IM_AES_CBC_CMAC_192,
            Self::ImAes256 => oids::PACE_ECDH_IM_AES_CBC_CMAC_256,
        }
    }
}

#[derive(Clone, Debug, clap::Args)]
struct EstablishOpts {
    #[command(flatten)]
    pub reader: ReaderOpts,

    /// The kind of password.
    #[arg(short, long, value_enum, default_value_t = SourceArg::Can)]
    pub source: SourceArg,

    /// File containing the password. For MRZ, this is the document number, date of birth and date
    /// of expiry, each followed by its check digit.
    #[arg(short, long = "password-file")]
    pub password_path: PathBuf,

    /// Mapping to prefer if the card offers several.
    #[arg(short, long, value_enum, default_value_t = MappingArg::Gm)]
    pub mapping: MappingArg,

    /// Run this protocol regardless of preference.
    #[arg(long, value_enum)]
    pub protocol: Option<ProtocolArg>,
}


fn list_readers() -> Result<(), String> {
    let mut transport = PcscTransport::new(TransportConfig::default());
    let readers = transport.list_readers()
        .map_err(|e| format!("failed to list readers: {}", e))?;
    if readers.is_empty() {
        println!("no readers connected");
    }
    for (i, reader) in readers.iter().enumerate() {
        println!("{}: {}", i, reader);
    }
    Ok(())
}


fn show_status(opts: &ReaderOpts) -> Result<(), String> {
    let mut transport = PcscTransport::new(opts.transport_config());
    transport.connect()
        .map_err(|e| format!("failed to connect to card: {}", e))?;
    let status = transport.status()
        .map_err(|e| format!("failed to obtain card status: {}", e))?;
    println!("reader:   {}", status.reader);
    println!("protocol: {}", status.protocol);
    println!("ATR:      {}", eid_pace::logging::hex_string(&status.atr));
    Ok(())
}


fn establish(opts: &EstablishOpts) -> Result<(), String> {
    let password_string = Zeroizing::new(
        std::fs::read_to_string(&opts.password_path)
            .map_err(|e| format!("failed to read password file: {}", e))?
    );

    let mut config = Config::new(opts.source.into());
    config.preferred_mapping = opts.mapping.into();
    config.forced_protocol = opts.protocol.map(|p| p.oid().to_owned());
    let password = config.password(password_string.trim());

    let mut transport = PcscTransport::new(opts.reader.transport_config());
    transport.connect()
        .map_err(|e| format!("failed to connect to card: {}", e))?;

    let card_access = read_card_access(&mut transport)
        .map_err(|e| format!("failed to read EF.CardAccess: {}", e))?;
    println!("EF.CardAccess:");
    print!("{}", hexdump(&card_access));

    let established = match pace::establish(&mut transport, &card_access, &password, &config) {
        Ok(established) => established,
        Err(e) => {
            if let Some(tries) = e.status().and_then(|status| status.remaining_tries()) {
                println!("password tries remaining: {}", tries);
            }
            let advice = if e.is_retryable() { "another attempt may succeed" } else { "do not retry" };
            return Err(format!("failed to establish PACE ({:?}, {}): {}", e.kind(), advice, e));
        },
    };
    info!("PACE established");
    if let Some(tries) = established.remaining_tries {
        println!("password tries remaining: {}", tries);
    }
    let mut secured = established.card;

    let protected_card_access = read_card_access(&mut secured)
        .map_err(|e| format!("failed to read EF.CardAccess through the secure channel: {}", e))?;
    println!("EF.CardAccess (secure messaging):");
    print!("{}", hexdump(&protected_card_access));
    if protected_card_access != card_access {
        return Err("EF.CardAccess differs when read through the secure channel".to_owned());
    }
    Ok(())
}


fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let result = match &args.mode {
        Mode::ListReaders => list_readers(),
        Mode::Status(opts) => show_status(opts),
        Mode::Establish(opts) => establish(opts),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        },
    }
}
