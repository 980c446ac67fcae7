use canopy::handlers::{
    Context, handle_families, handle_harvest, handle_orders, handle_plan, handle_purge,
    handle_refine, handle_species, print_banner,
};
use colored::Colorize;
use commands::command_argument_builder;
use tracing::Level;

mod commands;

#[tokio::main]
async fn main() {
    let cmd = command_argument_builder();
    let chosen_command = cmd.get_matches();
    let quiet = chosen_command.get_flag("quiet");

    // Show banner unless --quiet flag is set
    if !quiet {
        print_banner();
    }

    if chosen_command.subcommand().is_none() {
        // No subcommand provided, just show the banner
        return;
    }

    tracing_subscriber::fmt()
        .with_max_level(if quiet { Level::WARN } else { Level::INFO })
        .with_target(false)
        .init();

    let mut ctx = match Context::from_matches(&chosen_command) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("{} {:#}", "✗".red().bold(), e);
            std::process::exit(1);
        }
    };

    let result = match chosen_command.subcommand() {
        Some(("orders", args)) => handle_orders(&ctx, args).await,
        Some(("families", args)) => handle_families(&ctx, args).await,
        Some(("species", args)) => handle_species(&ctx, args).await,
        Some(("plan", args)) => handle_plan(&ctx, args).await,
        Some(("harvest", args)) => handle_harvest(&mut ctx, args).await,
        Some(("refine", args)) => handle_refine(&ctx, args),
        Some(("purge", _)) => handle_purge(&ctx),
        _ => unreachable!("clap should ensure we don't get here"),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "✗".red().bold(), e);
        std::process::exit(1);
    }
}

pub const CLAP_STYLING: clap::builder::styling::Styles = clap::builder::styling::Styles::styled()
    .header(clap_cargo::style::HEADER)
    .usage(clap_cargo::style::USAGE)
    .literal(clap_cargo::style::LITERAL)
    .placeholder(clap_cargo::style::PLACEHOLDER)
    .error(clap_cargo::style::ERROR)
    .valid(clap_cargo::style::VALID)
    .invalid(clap_cargo::style::INVALID);
