use std::path::PathBuf;
use std::process;
use std::rc::Rc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use actionvm::{
    assemble, disassemble, AsmError, Activation, CodeBuffer, Completion, DisplayTree, HostBridge,
    HostRequest, ObjectRef, Session, Stage, VmConfig,
};

#[derive(Parser, Debug)]
#[command(name = "actionvm", version, about = "Run or disassemble an action buffer")]
struct Cli {
    /// Raw action buffer, or assembler source with --asm
    input: Option<PathBuf>,

    /// Read the input file as assembler text
    #[arg(long)]
    asm: bool,

    /// Assembler source given on the command line
    #[arg(short = 'e', long = "inline", conflicts_with = "input")]
    inline: Option<String>,

    #[arg(long, default_value_t = 7)]
    swf_version: u8,

    #[arg(long, default_value_t = 256)]
    max_call_depth: usize,

    /// Frame count of the root timeline
    #[arg(long, default_value_t = 1)]
    frames: u32,

    /// Print the instruction listing instead of running
    #[arg(long)]
    disasm: bool,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("no input: pass a file or -e <source>")]
    MissingInput,
    #[error("error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("assembly failed: {0}")]
    Asm(#[from] AsmError),
}

/// Prints trace output and host requests on stdout.
struct ConsoleHost;

impl HostBridge for ConsoleHost {
    fn dispatch(&self, _root: &ObjectRef, request: HostRequest) {
        match request {
            HostRequest::FsCommand { command, args } => println!("fscommand {} {}", command, args),
            HostRequest::Navigate { url, target, .. } => println!("geturl {} {}", url, target),
        }
    }

    fn trace(&self, message: &str) {
        println!("{}", message);
    }
}

fn load(cli: &Cli) -> Result<Vec<u8>, CliError> {
    if let Some(source) = &cli.inline {
        return Ok(assemble(source)?);
    }
    let path = cli.input.as_ref().ok_or(CliError::MissingInput)?;
    let io_error = |source| CliError::Io { path: path.display().to_string(), source };
    if cli.asm {
        let source = std::fs::read_to_string(path).map_err(io_error)?;
        Ok(assemble(&source)?)
    } else {
        std::fs::read(path).map_err(io_error)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let bytes = match load(&cli) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };
    let code = CodeBuffer::read(bytes);

    if cli.disasm {
        for line in disassemble(&code) {
            println!("{}", line);
        }
        return;
    }

    let config = VmConfig { version: cli.swf_version, max_call_depth: cli.max_call_depth, rng_seed: None };
    let stage = Rc::new(Stage::new(cli.frames));
    let session = Session::new(config, stage.clone(), Rc::new(ConsoleHost));
    let mut activation = Activation::top_level(session, code, stage.root());

    let completion = match activation.run() {
        Ok(completion) => completion,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    if cli.json {
        let value = completion.clone().into_value();
        let report = serde_json::json!({
            "completion": completion.kind(),
            "value": value,
            "stack": activation.stack().as_slice(),
        });
        println!("{}", report);
    } else if let Completion::Returned(value) = &completion {
        println!("{}", value.to_string_versioned(cli.swf_version));
    }

    if completion == Completion::Aborted {
        eprintln!("Error: execution aborted on malformed bytecode");
        process::exit(1);
    }
}
