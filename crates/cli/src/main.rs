//! The main entrypoint for os-installer, which just performs global
//! runtime setup, and then calls out into the library.

use anyhow::Result;

fn run() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(installer_lib::cli::run_from_iter(std::env::args()))
}

fn main() {
    installer_utils::run_main(run)
}
