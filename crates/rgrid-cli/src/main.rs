//! rgrid-R: manipulate R resource-set objects on the command line.
//!
//! Reads R objects from stdin (concatenated JSON documents allowed) and
//! writes one R object per line on stdout. Exits 0 on success, 1 on I/O or
//! parse errors; `verify` exits 1 when expected resources are missing.

use std::io::Read;
use std::process::ExitCode;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use log::warn;

use rgrid_core::IdsetFlags;
use rgrid_rset::{Rlist, VerifyConfig, VerifyOutcome};

#[derive(Parser)]
#[command(name = "rgrid-R", about = "Manipulate R resource-set objects")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build an R object from ranks/cores/gpus/hosts options
    Encode {
        /// Ranks to encode (idset)
        #[arg(long, default_value = "0")]
        ranks: String,
        /// Core ids per rank (idset)
        #[arg(long, default_value = "")]
        cores: String,
        /// Gpu ids per rank (idset)
        #[arg(long)]
        gpus: Option<String>,
        /// Hostnames (hostlist), assigned in rank order
        #[arg(long)]
        hosts: Option<String>,
        /// Properties to set, as NAME or NAME:RANKS (repeatable)
        #[arg(long = "property")]
        properties: Vec<String>,
    },
    /// Append all R objects on stdin into one
    Append,
    /// Set difference of exactly two R objects on stdin
    Diff,
    /// Set intersection of all R objects on stdin
    Intersect,
    /// Re-number ranks densely and remap resource ids
    Remap,
    /// Re-assign ranks by hostname order
    Rerank {
        /// Hostlist giving the new rank order
        #[arg(long)]
        hosts: String,
    },
    /// Decode an R object and print a requested view
    Decode {
        /// Print the short-form summary
        #[arg(long)]
        short: bool,
        /// Print the nodelist
        #[arg(long)]
        nodelist: bool,
        /// Print the rank idset
        #[arg(long)]
        ranks: bool,
        /// Print the id count for one resource type
        #[arg(long)]
        count: Option<String>,
        /// Print the properties object
        #[arg(long)]
        properties: bool,
    },
    /// Verify the second R object on stdin satisfies the first
    Verify,
    /// Set properties (NAME:RANKS) on the R object from stdin
    SetProperty {
        /// NAME:RANKS pairs
        #[arg(required = true)]
        properties: Vec<String>,
    },
    /// Expand a resource config array (JSON file, `-` for stdin) into R
    ParseConfig {
        file: String,
    },
}

/// Read every concatenated JSON document on stdin as an Rlist.
fn read_all() -> anyhow::Result<Vec<Rlist>> {
    let stream =
        serde_json::Deserializer::from_reader(std::io::stdin().lock()).into_iter::<serde_json::Value>();
    let mut lists = Vec::new();
    for doc in stream {
        let doc = doc.context("parsing R object on stdin")?;
        lists.push(Rlist::from_json(&doc).context("decoding R object")?);
    }
    Ok(lists)
}

fn read_one() -> anyhow::Result<Rlist> {
    let mut lists = read_all()?;
    match lists.len() {
        1 => Ok(lists.pop().expect("checked")),
        n => bail!("expected exactly one R object on stdin, got {n}"),
    }
}

fn puts(rl: &Rlist) {
    println!("{}", rl.encode());
}

/// Apply a NAME or NAME:RANKS property argument.
fn set_property(rl: &mut Rlist, arg: &str) -> anyhow::Result<()> {
    let (name, ranks) = match arg.split_once(':') {
        Some((name, ranks)) => (name, ranks.to_string()),
        None => (arg, rl.ranks().encode(IdsetFlags::RANGE)),
    };
    rl.add_property(name, &ranks)
        .with_context(|| format!("setting property '{arg}'"))?;
    Ok(())
}

fn cmd_encode(
    ranks: &str,
    cores: &str,
    gpus: Option<&str>,
    hosts: Option<&str>,
    properties: &[String],
) -> anyhow::Result<()> {
    let ranks = rgrid_core::IdSet::decode(ranks).context("parsing --ranks")?;
    let mut rl = Rlist::new();
    for rank in ranks.iter() {
        rl.append_rank_cores(None, rank, cores)
            .context("adding cores")?;
        if let Some(gpus) = gpus {
            rl.rank_add_child(rank, "gpu", gpus).context("adding gpus")?;
        }
    }
    if let Some(hosts) = hosts {
        rl.assign_hosts(hosts).context("assigning hosts")?;
    }
    for p in properties {
        set_property(&mut rl, p)?;
    }
    puts(&rl);
    Ok(())
}

fn cmd_verify() -> anyhow::Result<ExitCode> {
    let lists = read_all()?;
    let [expected, actual] = lists.as_slice() else {
        bail!("verify expects two R objects on stdin (expected, then actual)");
    };
    match Rlist::verify(expected, actual, &VerifyConfig::default()) {
        Ok(VerifyOutcome::Exact) => Ok(ExitCode::SUCCESS),
        Ok(VerifyOutcome::Extra(note)) => {
            warn!("{note}");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("rgrid-R: verify: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn run(command: Command) -> anyhow::Result<ExitCode> {
    match command {
        Command::Encode {
            ranks,
            cores,
            gpus,
            hosts,
            properties,
        } => cmd_encode(&ranks, &cores, gpus.as_deref(), hosts.as_deref(), &properties)?,
        Command::Append => {
            let mut result = Rlist::new();
            for rl in read_all()? {
                result.append(&rl).context("append")?;
            }
            puts(&result);
        }
        Command::Diff => {
            let lists = read_all()?;
            let [a, b] = lists.as_slice() else {
                bail!("diff expects exactly two R objects on stdin");
            };
            puts(&Rlist::diff(a, b));
        }
        Command::Intersect => {
            let mut lists = read_all()?.into_iter();
            let Some(mut result) = lists.next() else {
                bail!("intersect expects at least one R object on stdin");
            };
            for rl in lists {
                result = Rlist::intersect(&result, &rl).context("intersect")?;
            }
            puts(&result);
        }
        Command::Remap => {
            let mut rl = read_one()?;
            rl.remap();
            puts(&rl);
        }
        Command::Rerank { hosts } => {
            let mut rl = read_one()?;
            rl.rerank(&hosts).context("rerank")?;
            puts(&rl);
        }
        Command::Decode {
            short,
            nodelist,
            ranks,
            count,
            properties,
        } => {
            let rl = read_one()?;
            let mut printed = false;
            if short {
                println!("{}", rl.dumps());
                printed = true;
            }
            if nodelist {
                let hl = rl
                    .nodelist()
                    .map(|hl| hl.encode())
                    .unwrap_or_default();
                println!("{hl}");
                printed = true;
            }
            if ranks {
                println!("{}", rl.ranks().encode(IdsetFlags::RANGE));
                printed = true;
            }
            if let Some(class) = count {
                println!("{}", rl.count(&class));
                printed = true;
            }
            if properties {
                println!("{}", rl.properties_encode());
                printed = true;
            }
            if !printed {
                puts(&rl);
            }
        }
        Command::Verify => return cmd_verify(),
        Command::SetProperty { properties } => {
            let mut rl = read_one()?;
            for p in &properties {
                set_property(&mut rl, p)?;
            }
            puts(&rl);
        }
        Command::ParseConfig { file } => {
            let text = if file == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                std::fs::read_to_string(&file).with_context(|| format!("reading {file}"))?
            };
            let conf: serde_json::Value =
                serde_json::from_str(&text).context("parsing config")?;
            let rl = Rlist::from_config(&conf).context("expanding config")?;
            puts(&rl);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("rgrid-R: {e:#}");
            ExitCode::FAILURE
        }
    }
}
