use std::{path::PathBuf, process::ExitCode};

use clap::{ArgAction, Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vaultlog::PatternFormatter;

#[derive(Parser)]
#[command(about = "The vaultlog command line tool.")]
struct Cli {
    /// Prints diagnostics, repeat for more detail.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generates a server ECDH key pair.
    GenKeys(GenKeys),
    /// Decodes a compressed and encrypted log file into a readable text file.
    Decode(Decode),
}

#[derive(Args)]
struct GenKeys;

impl GenKeys {
    fn exec(self) -> Result<(), String> {
        let (secret_key, public_key) = vaultlog::gen_ecdh_key_pair();

        println!("ECDH Keys:");
        println!("-----------");
        println!("Secret Key: {}", hex::encode(secret_key));
        println!("Public Key: {}", hex::encode(public_key));
        Ok(())
    }
}

#[derive(Args)]
struct Decode {
    /// Path to the log file.
    path: PathBuf,
    /// Path to the destination file.
    ///
    /// If it is not specified, `.txt` is appended to `path`.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// The server secret key in hex, required for encrypted log files.
    #[arg(short, long)]
    secret_key: Option<String>,
    /// The line pattern, e.g. `%D [%l] %F:%# %v`. The default layout is used if
    /// it is not specified.
    #[arg(short, long, default_value = "")]
    pattern: String,
}

impl Decode {
    fn exec(self) -> Result<(), String> {
        let output = self.output.unwrap_or_else(|| {
            let mut path = self.path.clone().into_os_string();
            path.push(".txt");
            path.into()
        });
        let secret_key = self
            .secret_key
            .map(|k| vaultlog::secret_key_from_hex(&k))
            .transpose()
            .map_err(|err| format!("invalid secret key: {err}"))?;

        tracing::info!(input = %self.path.display(), output = %output.display(), "decoding");
        let formatter = PatternFormatter::new(&self.pattern);
        vaultlog::decode_to_file(&self.path, &output, secret_key, formatter)
            .map_err(|err| err.to_string())?;

        println!("Decoded into {}", output.display());
        Ok(())
    }
}

impl Command {
    #[inline]
    fn exec(self) -> Result<(), String> {
        match self {
            Self::GenKeys(gen_keys) => gen_keys.exec(),
            Self::Decode(decode) => decode.exec(),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command.exec() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}
