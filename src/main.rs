//! Diversifier CLI - Run quality-diversity optimization from JSON configuration.

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use diversifier::{
    compute::{Archive, LogSink, Problem, apply_advretry, de_cma, minimize},
    schema::{AdvretryConfig, DiversifierConfig, ProblemKind, RunConfig},
};

fn usage(program: &str) {
    eprintln!("Usage: {} <run.json> [--archive <in.json>] [--save <out.json>]", program);
    eprintln!();
    eprintln!("Fill a niche archive for a benchmark problem.");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  run.json           Path to run configuration file");
    eprintln!("  --archive <file>   Continue a previously saved archive");
    eprintln!("  --save <file>      Save the resulting archive");
    eprintln!();
    eprintln!("Example configuration is generated with --example flag.");
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        usage(&args[0]);
        std::process::exit(1);
    }

    if args[1] == "--example" {
        print_example_config();
        return;
    }

    let config_path = PathBuf::from(&args[1]);
    let mut archive_path: Option<PathBuf> = None;
    let mut save_path: Option<PathBuf> = None;
    let mut rest = args[2..].iter();
    while let Some(flag) = rest.next() {
        let value = rest.next().map(PathBuf::from);
        match (flag.as_str(), value) {
            ("--archive", Some(path)) => archive_path = Some(path),
            ("--save", Some(path)) => save_path = Some(path),
            _ => {
                usage(&args[0]);
                std::process::exit(1);
            }
        }
    }

    // Load configuration
    let config_str = fs::read_to_string(&config_path).unwrap_or_else(|e| {
        eprintln!("Error reading config file: {}", e);
        std::process::exit(1);
    });

    let run: RunConfig = serde_json::from_str(&config_str).unwrap_or_else(|e| {
        eprintln!("Error parsing config: {}", e);
        std::process::exit(1);
    });

    let problem = Problem::from_kind(&run.problem).unwrap_or_else(|e| {
        eprintln!("Error in problem: {}", e);
        std::process::exit(1);
    });
    let bounds = problem.bounds();
    let desc_bounds = problem.desc_bounds();

    let archive: Option<Archive> = archive_path.map(|path| {
        Archive::load(&path).unwrap_or_else(|e| {
            eprintln!("Error loading archive {}: {}", path.display(), e);
            std::process::exit(1);
        })
    });

    let config = &run.diversifier;
    println!("Diversifier");
    println!("===========");
    println!("Problem: {} ({} dimensions)", problem.name(), bounds.dim());
    println!("Niches: {}", config.niche_num);
    println!("Workers: {}", config.workers());
    println!("Retries: {}", config.retries());
    let stages: Vec<String> = config
        .opt_params
        .stages()
        .iter()
        .map(|p| format!("{} (popsize {})", p.solver, p.popsize))
        .collect();
    println!("Solvers: {}", stages.join(" -> "));
    if archive.is_some() {
        println!("Continuing saved archive");
    }
    println!();

    let start = Instant::now();
    let archive = minimize(&problem, &bounds, &desc_bounds, config, archive, &LogSink)
        .unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        });

    if let Some(advretry) = &run.advretry {
        println!("Refining with {} classical retries...", advretry.num_retries);
        let fitness = |x: &[f64]| problem.objective(x);
        let descriptors = |x: &[f64]| problem.descriptors(x);
        apply_advretry(
            &fitness,
            &descriptors,
            &bounds,
            &archive,
            &de_cma(),
            advretry,
            &LogSink,
        )
        .unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        });
    }

    println!();
    println!("Result:");
    println!(
        "  Occupied niches: {}/{}",
        archive.get_occupied(),
        archive.capacity()
    );
    println!("  Best elites:");
    for niche in archive.sorted_niches().into_iter().take(5) {
        if let Some(elite) = archive.elite(niche) {
            println!(
                "    niche {:>5}: y={:.6} desc={:?}",
                elite.niche, elite.y, elite.desc
            );
        }
    }
    println!("Time: {:.2}s", start.elapsed().as_secs_f32());

    if let Some(path) = save_path {
        archive.save(&path).unwrap_or_else(|e| {
            eprintln!("Error saving archive {}: {}", path.display(), e);
            std::process::exit(1);
        });
        println!("Archive saved to {}", path.display());
    }
}

fn print_example_config() {
    let run = RunConfig {
        problem: ProblemKind::Arm { joints: 10 },
        diversifier: DiversifierConfig {
            niche_num: 1000,
            retries: Some(64),
            random_seed: Some(42),
            ..Default::default()
        },
        advretry: Some(AdvretryConfig {
            num_retries: 200,
            ..Default::default()
        }),
    };
    match serde_json::to_string_pretty(&run) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing example: {}", e),
    }
}
