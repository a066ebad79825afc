use clap::Parser;

fn main() -> anyhow::Result<()> {
    // Load .env early; ignore if missing.
    dotenvy::dotenv().ok();

    binsim_search::init_tracing();
    let cli = binsim_search::Cli::parse();
    binsim_search::run(cli)
}
