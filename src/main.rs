use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use pourover::config::{Engine, RuntimeConfig};
use pourover::jvm::{read_class_file, JVMParser};

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum EngineArg {
    #[default]
    Interpreter,
    Jit,
}

impl From<EngineArg> for Engine {
    fn from(arg: EngineArg) -> Self {
        match arg {
            EngineArg::Interpreter => Engine::Interpreter,
            EngineArg::Jit => Engine::Jit,
        }
    }
}

#[derive(Parser)]
#[command(name = "pourover")]
#[command(about = "Run the main method of a JVM class file", long_about = None)]
struct Cli {
    /// The class file to run
    class_file: PathBuf,

    /// Execution engine (interpreter, jit)
    #[arg(long, value_enum, default_value = "interpreter")]
    engine: EngineArg,

    /// Dump the block graph of every compiled method to stderr
    #[arg(long)]
    dump_cfg: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let config = RuntimeConfig {
        engine: cli.engine.into(),
        dump_cfg: cli.dump_cfg,
    };

    let result = read_class_file(&cli.class_file)
        .and_then(|bytes| JVMParser::parse(&bytes))
        .and_then(|class| pourover::run(&class, &config, &mut std::io::stdout().lock()));
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
