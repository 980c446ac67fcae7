use crate::CLAP_STYLING;
use canopy_core::stage::{FAMILIES_STAGE, ORDERS_STAGE, SPECIES_STAGE};
use clap::{arg, command};

pub(crate) fn command_argument_builder() -> clap::Command {
    clap::Command::new("canopy")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("canopy")
        .styles(CLAP_STYLING)
        .about("Resumable, concurrent harvester for taxonomy sites")
        .arg(
            arg!(-q --"quiet" "Suppress banner and non-essential output")
                .required(false)
                .global(true),
        )
        .arg(
            arg!(-d --"data-dir" <DIR>)
                .required(false)
                .help("Root of the data collections")
                .default_value("./data")
                .global(true),
        )
        .arg(
            arg!(-c --"config" <FILE>)
                .required(false)
                .help("JSON file overriding the default settings")
                .value_parser(clap::value_parser!(std::path::PathBuf))
                .global(true),
        )
        .subcommand_required(false)
        .subcommand(
            command!("orders")
                .about("Walk the root taxon page and save the orders found under it")
                .arg(
                    arg!(-r --"root-url" <URL>)
                        .required(false)
                        .help("Root taxon page (default: from config)"),
                )
                .arg(headed_arg()),
        )
        .subcommand(
            command!("families")
                .about("Expand every saved order into its families")
                .arg(
                    arg!(-i --"input" <STAGE>)
                        .required(false)
                        .help("Orders stage name or file")
                        .default_value(ORDERS_STAGE),
                )
                .arg(headed_arg()),
        )
        .subcommand(
            command!("species")
                .about("Scroll each family's species grid and save the inventory")
                .arg(
                    arg!(-i --"input" <STAGE>)
                        .required(false)
                        .help("Families stage name or file")
                        .default_value(FAMILIES_STAGE),
                )
                .arg(headed_arg()),
        )
        .subcommand(
            command!("plan")
                .about("Build a scraping plan from the listing API")
                .arg(
                    arg!(-t --"taxon" <ID>)
                        .required(false)
                        .help("Parent taxon id (default: from config)"),
                ),
        )
        .subcommand(
            command!("harvest")
                .about("Fetch every planned detail page that is not checkpointed yet")
                .arg(
                    arg!(-p --"plan" <STAGE>)
                        .required(false)
                        .help("Stage name or file holding the entities to fetch")
                        .default_value(SPECIES_STAGE),
                )
                .arg(
                    arg!(-m --"mode" <MODE>)
                        .required(false)
                        .help("Fetch detail pages through a browser or plain HTTP")
                        .value_parser(["browser", "http"])
                        .default_value("browser"),
                )
                .arg(
                    arg!(-w --"workers" <NUM_WORKERS>)
                        .required(false)
                        .help("Number of concurrent workers (default: from config)")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--"seed" <SEED>)
                        .required(false)
                        .help("Seed for shuffling and identity choice")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    arg!(-f --"format" <FORMAT>)
                        .required(false)
                        .help("Summary format: text, json")
                        .value_parser(["text", "json"])
                        .default_value("text"),
                )
                .arg(headed_arg()),
        )
        .subcommand(
            command!("refine")
                .about("Extract structured records from every harvested page")
                .arg(
                    arg!(-o --"output" <DIR>)
                        .required(false)
                        .help("Output directory (default: <data-dir>/silver/refined)")
                        .value_parser(clap::value_parser!(std::path::PathBuf)),
                ),
        )
        .subcommand(
            command!("purge").about("Delete harvested pages that captured a throttle page"),
        )
}

fn headed_arg() -> clap::Arg {
    arg!(--"headed")
        .required(false)
        .help("Show the browser window")
        .action(clap::ArgAction::SetTrue)
}
