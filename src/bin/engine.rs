//! CLI driver (spec.md §6 "External interfaces"): `engine <module.wasm>
//! [module2.wasm ...]`. The first module is main and supplies the start
//! function; later modules exist only to satisfy its imports.

use std::process::ExitCode;

use log::error;

use wasm_vm::engine::Engine;
use wasm_vm::value::TaggedValue;

fn main() -> ExitCode {
    env_logger::init();

    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        eprintln!("usage: engine <module.wasm> [module2.wasm ...]");
        return ExitCode::FAILURE;
    }

    let bytes: Vec<Vec<u8>> = match paths.iter().map(std::fs::read).collect() {
        Ok(b) => b,
        Err(e) => {
            error!("failed to read module file: {e}");
            return ExitCode::FAILURE;
        }
    };
    let slices: Vec<&[u8]> = bytes.iter().map(Vec::as_slice).collect();

    let program = match Engine::load_and_link(&slices) {
        Ok(p) => p,
        Err(e) => {
            error!("load error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match Engine::run_start(&program) {
        Ok(Some(TaggedValue::I32(code))) => ExitCode::from(code as u8),
        Ok(_) => ExitCode::SUCCESS,
        Err(trap) => {
            error!("{trap}");
            ExitCode::FAILURE
        }
    }
}
