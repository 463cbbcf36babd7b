// Copyright 2023 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

use std::{io::Write, fs::File, time::Instant};
use clap::{Command, Arg, ArgAction, crate_description, crate_version, value_parser};
use clap_num::{maybe_hex, si_number};
use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};

use mdrflash::{FlashBank, BankConfig, MemoryRegion, WriteRoutine, Emulator, EmulatedChip};

const DATA_PROGRESS_TPL: &str =
    " {msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}; {eta_precise})";
const SECTOR_PROGRESS_TPL: &str =
    " {msg} [{bar:40}] {pos}/{len} sectors ({eta_precise})";
const DATA_PROGRESS_CHARS: &str = "=> ";

#[allow(clippy::cognitive_complexity)]
fn main() -> anyhow::Result<()> {
    let matches = Command::new("mdrflash")
        .version(crate_version!())
        .about(crate_description!())
        .subcommand_required(true)
        .arg_required_else_help(true)
        .propagate_version(true)
        .infer_subcommands(true)
        .arg(Arg::new("quiet")
             .help("Suppress informative output and raise log level to errors only")
             .long("quiet")
             .short('q')
             .action(ArgAction::SetTrue)
             .global(true))
        .arg(Arg::new("verbose")
             .help("Increase log level, specify once for info, twice for debug, three times for trace")
             .long("verbose")
             .short('v')
             .action(ArgAction::Count)
             .conflicts_with("quiet")
             .global(true))
        .arg(Arg::new("chip")
             .help("Emulated chip to operate on")
             .long("chip")
             .short('c')
             .action(ArgAction::Set)
             .default_value("mdr32fx")
             .value_parser(["mdr32fx", "mdr32f02fi", "mdr1206afi", "mdr1206fi"])
             .global(true))
        .arg(Arg::new("region")
             .help("Flash memory region the bank covers")
             .long("region")
             .short('r')
             .action(ArgAction::Set)
             .default_value("main")
             .value_parser(["main", "info"])
             .global(true))
        .arg(Arg::new("base")
             .help("Bank base address, defaults to the chip's region base \
                   (decimal, or hex with 0x prefix)")
             .long("base")
             .action(ArgAction::Set)
             .value_parser(maybe_hex::<u32>)
             .global(true))
        .arg(Arg::new("size")
             .help("Bank size in bytes, defaults to the chip's region size (k and M suffixes allowed)")
             .long("size")
             .action(ArgAction::Set)
             .value_parser(si_number::<u32>)
             .global(true))
        .arg(Arg::new("sector-count")
             .help("Number of sectors in the bank, defaults to 4 KiB sectors")
             .long("sector-count")
             .action(ArgAction::Set)
             .value_parser(value_parser!(u32))
             .global(true))
        .arg(Arg::new("bank-count")
             .help("Number of separately mass-erased units in the bank")
             .long("bank-count")
             .action(ArgAction::Set)
             .default_value("1")
             .value_parser(value_parser!(u32))
             .global(true))
        .arg(Arg::new("ram-size")
             .help("Emulated RAM available for working areas (k and M suffixes allowed)")
             .long("ram-size")
             .action(ArgAction::Set)
             .default_value("32k")
             .value_parser(si_number::<u32>)
             .global(true))
        .arg(Arg::new("loader")
             .help("Write routine binary to use for accelerated writes")
             .long("loader")
             .action(ArgAction::Set)
             .global(true))
        .arg(Arg::new("image")
             .help("File to load into the emulated flash region before running")
             .long("image")
             .action(ArgAction::Set)
             .global(true))
        .arg(Arg::new("save")
             .help("File to save the emulated flash region to after running")
             .long("save")
             .action(ArgAction::Set)
             .global(true))
        .arg(Arg::new("controller-read")
             .help("Read the info region through the flash controller registers")
             .long("controller-read")
             .action(ArgAction::SetTrue)
             .global(true))
        .subcommand(Command::new("probe")
            .about("Identify the chip and its flash geometry"))
        .subcommand(Command::new("info")
            .about("Show flash bank description and sectors"))
        .subcommand(Command::new("erase")
            .about("Erase flash sectors, the whole bank by default")
            .arg(Arg::new("first")
                 .help("First sector to erase")
                 .long("first")
                 .action(ArgAction::Set)
                 .value_parser(value_parser!(usize)))
            .arg(Arg::new("last")
                 .help("Last sector to erase, inclusive")
                 .long("last")
                 .action(ArgAction::Set)
                 .value_parser(value_parser!(usize))))
        .subcommand(Command::new("write")
            .about("Write binary file to flash")
            .arg(Arg::new("file")
                 .help("File to write to flash")
                 .required(true))
            .arg(Arg::new("offset")
                 .help("Start offset (in bytes) in the bank to write to (decimal, or hex with 0x prefix)")
                 .long("offset")
                 .value_parser(maybe_hex::<u32>)
                 .default_value("0"))
            .arg(Arg::new("erase")
                 .help("Don't erase the sectors being written first")
                 .long("no-erase")
                 .action(ArgAction::SetFalse))
            .arg(Arg::new("verify")
                 .help("Disable readback verification")
                 .short('n')
                 .long("no-verify")
                 .action(ArgAction::SetFalse)))
        .subcommand(Command::new("read")
            .about("Read flash contents to file")
            .arg(Arg::new("file")
                 .help("File to write flash contents to")
                 .required(true))
            .arg(Arg::new("offset")
                 .help("Start offset (in bytes) of read (decimal, or hex with 0x prefix)")
                 .long("offset")
                 .action(ArgAction::Set)
                 .value_parser(maybe_hex::<u32>)
                 .default_value("0"))
            .arg(Arg::new("length")
                 .help("Length (in bytes) of read, defaults to the rest of the bank \
                       (decimal, or hex with 0x prefix)")
                 .long("length")
                 .action(ArgAction::Set)
                 .value_parser(maybe_hex::<usize>)))
        .subcommand(Command::new("blank-check")
            .about("Check which sectors are erased"))
        .get_matches();

    let t0 = Instant::now();
    let quiet = matches.get_flag("quiet");
    let verbose = matches.get_count("verbose");
    let env = if quiet {
        env_logger::Env::default().default_filter_or("error")
    } else if verbose == 0 {
        env_logger::Env::default().default_filter_or("warn")
    } else if verbose == 1 {
        env_logger::Env::default().default_filter_or("info")
    } else if verbose == 2 {
        env_logger::Env::default().default_filter_or("debug")
    } else {
        env_logger::Env::default().default_filter_or("trace")
    };
    env_logger::Builder::from_env(env).format_timestamp(None).init();

    // Set up the emulated target.
    let chip_name = matches.get_one::<String>("chip").unwrap();
    let chip = match EmulatedChip::from_name(chip_name) {
        Some(chip) => chip,
        None => bail!("Unknown chip {chip_name}"),
    };
    let region = match matches.get_one::<String>("region").unwrap().as_str() {
        "info" => MemoryRegion::Info,
        _ => MemoryRegion::Main,
    };
    let mut emu = Emulator::new(chip);
    emu.set_ram_size(*matches.get_one::<u32>("ram-size").unwrap());

    if let Some(path) = matches.get_one::<String>("image") {
        let image = std::fs::read(path).with_context(|| format!("Reading image {path}"))?;
        let array = match region {
            MemoryRegion::Main => emu.main_mut(),
            MemoryRegion::Info => emu.info_mut(),
        };
        if image.len() > array.len() {
            bail!("Image of {} bytes does not fit in {} byte {}",
                  image.len(), array.len(), region.name());
        }
        array[..image.len()].copy_from_slice(&image);
    }

    // Declare the flash bank, defaulting to the chip's own layout.
    let (default_base, default_size) = match region {
        MemoryRegion::Main => (chip.main_base(), chip.main_size()),
        MemoryRegion::Info => (chip.info_base().unwrap_or(0), chip.info_size()),
    };
    let base = matches.get_one::<u32>("base").copied().unwrap_or(default_base);
    let size = matches.get_one::<u32>("size").copied().unwrap_or(default_size);
    let sector_count = matches.get_one::<u32>("sector-count").copied()
                              .unwrap_or_else(|| (size / 4096).max(1));
    let bank_count = *matches.get_one::<u32>("bank-count").unwrap();
    let config = BankConfig { base, size, region, bank_count, sector_count };
    let mut bank = FlashBank::new(chip.architecture(), config);

    if let Some(path) = matches.get_one::<String>("loader") {
        let code = std::fs::read(path).with_context(|| format!("Reading loader {path}"))?;
        let framing = chip.profile().routine_framing();
        log::info!("Using {} byte write routine from {path} with {:?} framing", code.len(), framing);
        bank.set_write_routine(Some(WriteRoutine::new(code, framing)));
    }
    bank.set_controller_read(matches.get_flag("controller-read"));

    match matches.subcommand_name() {
        Some("probe") => {
            bank.probe(&mut emu)?;
            match bank.chip_id() {
                Some(id) => println!("Found {}", id),
                None => println!("Using {} parameters", bank.profile().name()),
            }
            println!("{} bank @0x{:08X}, {} bytes in {} sectors, {} erase units",
                     bank.region().name(), bank.base(), bank.size(),
                     bank.sectors().len(), bank.bank_count());
            println!("Page size: {} bytes", bank.profile().page_size());
            if let Some(calibration) = bank.calibration() {
                println!("Calibration values: {:02X?}", calibration);
            }
        },
        Some("info") => {
            bank.auto_probe(&mut emu)?;
            println!("{}", bank.info());
            for (i, sector) in bank.sectors().iter().enumerate() {
                println!("  #{:3}: 0x{:06X} ({} KiB){}", i, sector.offset, sector.size / 1024,
                         if sector.erased { " erased" } else { "" });
            }
        },
        Some("erase") => {
            let matches = matches.subcommand_matches("erase").unwrap();
            bank.auto_probe(&mut emu)?;
            let count = bank.sectors().len();
            let first = matches.get_one::<usize>("first").copied().unwrap_or(0);
            let last = matches.get_one::<usize>("last").copied().unwrap_or(count - 1);
            if quiet {
                bank.erase(&mut emu, first, last)?;
            } else {
                let pb = progress_bar((last + 1).saturating_sub(first) as u64,
                                      SECTOR_PROGRESS_TPL, "Erasing")?;
                bank.erase_cb(&mut emu, first, last, |n| pb.set_position(n as u64))?;
                pb.finish();
            }
        },
        Some("write") => {
            let matches = matches.subcommand_matches("write").unwrap();
            let path = matches.get_one::<String>("file").unwrap();
            let offset = *matches.get_one::<u32>("offset").unwrap();
            let data = std::fs::read(path).with_context(|| format!("Reading {path}"))?;
            bank.auto_probe(&mut emu)?;

            if matches.get_flag("erase") && !data.is_empty() {
                let end = offset as usize + data.len();
                let sectors: Vec<usize> = bank.sectors().iter().enumerate()
                    .filter(|(_, s)| (s.offset as usize) < end
                                     && offset < s.offset + s.size)
                    .map(|(i, _)| i)
                    .collect();
                if let (Some(&first), Some(&last)) = (sectors.first(), sectors.last()) {
                    if quiet {
                        bank.erase(&mut emu, first, last)?;
                    } else {
                        let pb = progress_bar(sectors.len() as u64, SECTOR_PROGRESS_TPL,
                                              "Erasing")?;
                        bank.erase_cb(&mut emu, first, last, |n| pb.set_position(n as u64))?;
                        pb.finish();
                    }
                }
            }

            if quiet {
                bank.write(&mut emu, &data, offset)?;
            } else {
                let pb = progress_bar(data.len() as u64, DATA_PROGRESS_TPL, "Writing")?;
                bank.write_cb(&mut emu, &data, offset, |n| pb.set_position(n as u64))?;
                pb.finish();
            }

            if matches.get_flag("verify") {
                let mut readback = vec![0u8; data.len()];
                bank.read(&mut emu, &mut readback, offset)?;
                match readback.iter().zip(data.iter()).position(|(a, b)| a != b) {
                    Some(idx) => bail!("Readback verification failed at offset 0x{:08X}",
                                       offset as usize + idx),
                    None => if !quiet { println!("Readback verified.") },
                }
            }
        },
        Some("read") => {
            let matches = matches.subcommand_matches("read").unwrap();
            let path = matches.get_one::<String>("file").unwrap();
            let offset = *matches.get_one::<u32>("offset").unwrap();
            bank.auto_probe(&mut emu)?;
            let length = if let Some(length) = matches.get_one::<usize>("length") {
                *length
            } else {
                log::info!("No length specified, reading to end of bank");
                bank.size().saturating_sub(offset) as usize
            };
            let mut data = vec![0u8; length];
            bank.read(&mut emu, &mut data, offset)?;
            let mut file = File::create(path)?;
            file.write_all(&data)?;
        },
        Some("blank-check") => {
            bank.blank_check(&mut emu)?;
            let dirty: Vec<usize> = bank.sectors().iter().enumerate()
                .filter(|(_, s)| !s.erased)
                .map(|(i, _)| i)
                .collect();
            if dirty.is_empty() {
                println!("All {} sectors are blank.", bank.sectors().len());
            } else {
                println!("{} of {} sectors are not blank: {:?}",
                         dirty.len(), bank.sectors().len(), dirty);
            }
        },
        _ => panic!("Unhandled command."),
    }

    let violations = emu.violations();
    if !violations.is_empty() {
        log::warn!("Emulated controller saw {} waveform violations:", violations.len());
        for violation in violations {
            log::warn!("  {}", violation);
        }
    }

    if let Some(path) = matches.get_one::<String>("save") {
        let array = match region {
            MemoryRegion::Main => emu.main(),
            MemoryRegion::Info => emu.info(),
        };
        let mut file = File::create(path)?;
        file.write_all(array)?;
    }

    let t1 = t0.elapsed();
    if !quiet {
        println!("Finished in {}.{:02}s", t1.as_secs(), t1.subsec_millis()/10);
    }

    Ok(())
}

fn progress_bar(len: u64, template: &str, msg: &'static str) -> anyhow::Result<ProgressBar> {
    let style = ProgressStyle::default_bar()
        .template(template)?
        .progress_chars(DATA_PROGRESS_CHARS);
    let pb = ProgressBar::new(len).with_style(style);
    pb.set_message(msg);
    Ok(pb)
}
