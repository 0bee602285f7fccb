use crate::prelude::*;
use dpwrap_engine::prelude::*;
use dpwrap_engine::sim::Simulation;

pub mod prelude {
    pub use super::args::prelude::*;
}

pub mod args;

struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            println!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) { }
}

fn main() {
    let args = match <Args as clap::Parser>::try_parse() {
        Ok(args) => args,
        Err(err) => {
            use clap::error::ErrorKind::*;

            let exit_code = match err.kind() {
                DisplayHelp |
                DisplayHelpOnMissingArgumentOrSubcommand |
                DisplayVersion => 0,
                _ => 2,
            };

            err.print().unwrap();
            std::process::exit(exit_code);
        },
    };

    init_logging(&args);

    let quiet = args.quiet;
    match main_wo_exit_code(args) {
        Ok(admitted_all) => {
            if quiet {
                if admitted_all {
                    std::process::exit(0);
                } else {
                    std::process::exit(1);
                }
            }
        },
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        },
    };
}

fn init_logging(args: &Args) {
    let level = match (args.quiet, args.verbose) {
        (true, _) => log::LevelFilter::Off,
        (_, 0) => log::LevelFilter::Warn,
        (_, 1) => log::LevelFilter::Info,
        (_, 2) => log::LevelFilter::Debug,
        (_, _) => log::LevelFilter::Trace,
    };

    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

fn check_args(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.fleet.num_pcpus == 0 {
        return Err(format!("Must specify a positive number of PCPUs").into());
    }
    if args.fleet.dom0_vcpus >= args.fleet.num_pcpus {
        return Err(format!(
            "dom0 takes one PCPU per VCPU; {} VCPUs leave no PCPU for guests",
            args.fleet.dom0_vcpus
        ).into());
    }
    if args.run_ms < 0 {
        return Err(format!("Run length must be non-negative").into());
    }
    Ok(())
}

fn main_wo_exit_code(args: Args) -> Result<bool, Box<dyn std::error::Error>> {
    check_args(&args)?;

    let vcpu_set = parse_vcpu_set(
        &args.vcpu_set.vcpu_set_file,
        args.vcpu_set.vcpu_set_file_ty,
    )?;

    let mut sim = Simulation::new(args.fleet.num_pcpus, args.fleet.dom0_vcpus)?;

    let mut admitted_all = true;
    let mut admitted = Vec::new();
    for spec in &vcpu_set {
        match sim.admit(spec) {
            Ok(()) => admitted.push(spec.clone()),
            Err(Error::NoBandwidth) => {
                admitted_all = false;
                if !args.quiet {
                    println!("{}.{}: REJECTED (no bandwidth)", spec.domain, spec.vcpu);
                }
            },
            Err(err) => return Err(err.into()),
        }
    }

    // One short settle run so placements reflect the requested
    // parameters rather than the admission defaults.
    sim.run_until(Time::micros(100));

    if !args.quiet {
        for spec in &admitted {
            let p = sim.sched.placement(spec.domain, spec.vcpu)?;
            match p.cpu_b {
                Some(cpu_b) => println!(
                    "{}.{}: split over PCPU {} ({}/{}) and PCPU {} ({}/{})",
                    spec.domain, spec.vcpu,
                    p.cpu_a, p.slice_a, p.period,
                    cpu_b, p.slice_b, p.period),
                None => println!(
                    "{}.{}: PCPU {} ({}/{})",
                    spec.domain, spec.vcpu, p.cpu_a, p.slice_a, p.period),
            }
        }

        for (cpu, pct) in sim.sched.utilization_report() {
            println!("PCPU {cpu}: {pct}% booked");
        }
    }

    if args.run_ms > 0 {
        sim.run_until(Time::millis(args.run_ms));

        if !args.quiet {
            println!("--- {} ms simulated ---", args.run_ms);
            for acc in sim.accounts() {
                println!(
                    "{}.{}: {} ms granted over {} dispatches, {} deadlines",
                    acc.domain, acc.vcpu,
                    acc.allotted.as_millis(),
                    acc.dispatches,
                    acc.deadlines_observed);
            }
        }
    }

    Ok(admitted_all)
}
