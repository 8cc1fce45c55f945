//! A small JVM: class file parsing, a bytecode interpreter and a JIT front
//! end producing basic-block graphs.
use std::io::Write;

use log::info;

pub mod backend;
pub mod bytecode;
pub mod config;
pub mod error;
pub mod executor;
pub mod jit;
pub mod jvm;
pub mod reader;
pub mod runtime;
pub mod types;

#[cfg(test)]
mod testutil;

use backend::Backend;
use config::{Engine, RuntimeConfig};
use error::Result;
use executor::{CodeGenerator, Evaluator};
use jit::JitCache;
use jvm::ClassFile;
use runtime::Runtime;

/// Run the `main` method of `class` with the configured engine, printing
/// program output to `out`.
pub fn run(class: &ClassFile, config: &RuntimeConfig, out: &mut impl Write) -> Result<()> {
    info!("running {} with {:?}", class.name, config.engine);
    match config.engine {
        Engine::Interpreter => Runtime::new(class, out).run(),
        Engine::Jit => {
            let mut cache = JitCache::new(class);
            let main = cache.find_method("main")?;
            let entry = cache.compile(main)?;
            if config.dump_cfg {
                let mut stderr = std::io::stderr().lock();
                for function in cache.functions() {
                    writeln!(stderr, "{function}")?;
                }
            }
            let mut evaluator = Evaluator::new(out);
            for function in cache.functions() {
                evaluator.declare(function.clone())?;
            }
            evaluator.execute(&entry)
        }
    }
}
