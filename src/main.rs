mod chunkstore;
mod dict;
mod executor;
mod feedback;
mod fuzzer;
mod grammar;
mod hash;
mod mutator;
mod queue;
mod state;
mod tree;
mod vuzzer;

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{arg, value_parser, ArgAction, Command};
use libafl_bolts::{current_nanos, rands::StdRand, Error};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::executor::command::CommandExecutor;
use crate::fuzzer::{FuzzerSetting, GrammarFuzzer};
use crate::grammar::parser::load_grammar;
use crate::state::FuzzState;
use crate::tree::{Tree, TreeLike};
use crate::vuzzer::state::VUzzerState;
use crate::vuzzer::{VUzzer, VUzzerSetting};

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn stop_handler(_signal: i32) {
    // async-signal-safe: flip the flag, cleanup happens at loop boundaries
    STOP.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<(), Error> {
    let action = SigAction::new(
        SigHandler::Handler(stop_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        unsafe {
            sigaction(signal, &action)
                .map_err(|e| Error::unknown(format!("sigaction({signal:?}): {e}")))?;
        }
    }
    Ok(())
}

fn get_args() -> clap::ArgMatches {
    let cmd = Command::new("tarsier")
        .about("Grammar-aware coverage-guided fuzzer")
        .subcommand_required(true)
        .args_conflicts_with_subcommands(true)
        .subcommand(
            Command::new("fuzz")
                .about("Fuzz with the grammar engine")
                .arg(arg!(--grammar <PATH> "Grammar file path").required(true))
                .arg(arg!(--"start-symbol" <SYMBOL>).default_value("start"))
                .arg(arg!(-o --"output-dir" <PATH> "Workspace for corpus and crashes").required(true))
                .arg(
                    arg!(--seed <N> "RNG seed for reproducible runs")
                        .value_parser(value_parser!(u64))
                        .required(false),
                )
                .arg(
                    arg!(--"max-tree-len" <N> "Budget in tree nodes for generated derivations")
                        .value_parser(value_parser!(usize))
                        .default_value("200"),
                )
                .arg(
                    arg!(--"map-size" <N> "Coverage bitmap size")
                        .value_parser(value_parser!(usize))
                        .default_value("65536"),
                )
                .arg(
                    arg!(--"generate-inputs" <N> "Fresh derivations per generation round")
                        .value_parser(value_parser!(usize))
                        .default_value("100"),
                )
                .arg(
                    arg!(--"havoc-iterations" <N> "Randomized mutations per queue entry")
                        .value_parser(value_parser!(usize))
                        .default_value("100"),
                )
                .arg(
                    arg!(--"chunks-per-rule" <N> "Spliceable subtrees kept per rule")
                        .value_parser(value_parser!(usize))
                        .default_value("512"),
                )
                .arg(
                    arg!(--timeout <MS> "PUT execution timeout")
                        .value_parser(value_parser!(u64))
                        .default_value("1000"),
                )
                .arg(arg!(--"feedback-file" <PATH> "Coverage probe output file").required(true))
                .arg(
                    arg!(--"debug-child" "Keep the child's stdout and stderr")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    arg!(<arguments> ... "PUT command line; @@ is replaced by the input path")
                        .trailing_var_arg(true),
                ),
        )
        .subcommand(
            Command::new("vuzzer")
                .about("Fuzz with the evolutionary byte-level engine")
                .arg(arg!(-i --"corpus-dir" <PATH> "Directory with initial seeds").required(true))
                .arg(arg!(-o --"output-dir" <PATH> "Output directory").required(true))
                .arg(
                    arg!(--seed <N> "RNG seed for reproducible runs")
                        .value_parser(value_parser!(u64))
                        .required(false),
                )
                .arg(arg!(--weights <PATH> "Basic-block weight table").required(false))
                .arg(arg!(--"full-dict" <PATH> "Full-bytes dictionary").required(false))
                .arg(arg!(--"unique-dict" <PATH> "Unique-bytes dictionary").required(false))
                .arg(
                    arg!(--"pop-size" <N> "Population size")
                        .value_parser(value_parser!(usize))
                        .default_value("100"),
                )
                .arg(
                    arg!(--"crossover-prob" <F> "Crossover probability while breeding")
                        .value_parser(value_parser!(f64))
                        .default_value("0.4"),
                )
                .arg(
                    arg!(--"keep-num" <N> "Parents always kept per round")
                        .value_parser(value_parser!(usize))
                        .default_value("10"),
                )
                .arg(
                    arg!(--"ehb-interval" <N> "Rounds between error-handling probes")
                        .value_parser(value_parser!(u64))
                        .default_value("10"),
                )
                .arg(
                    arg!(--"ehb-penalty" <F> "Fitness penalty per error-handling block")
                        .value_parser(value_parser!(f64))
                        .default_value("1.0"),
                )
                .arg(
                    arg!(--timeout <MS> "PUT execution timeout")
                        .value_parser(value_parser!(u64))
                        .default_value("1000"),
                )
                .arg(arg!(--"feedback-file" <PATH> "Coverage probe output file").required(true))
                .arg(arg!(--"taint-file" <PATH> "Taint probe output file").required(true))
                .arg(
                    arg!(--"debug-child" "Keep the child's stdout and stderr")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    arg!(<arguments> ... "PUT command line; @@ is replaced by the input path")
                        .trailing_var_arg(true),
                ),
        )
        .subcommand(
            Command::new("example")
                .about("Generate samples from a grammar")
                .arg(arg!(--grammar <PATH> "Grammar file path").required(true))
                .arg(arg!(--"start-symbol" <SYMBOL>).default_value("start"))
                .arg(
                    arg!(-n <N> "Generate N samples")
                        .value_parser(value_parser!(usize))
                        .default_value("1"),
                )
                .arg(
                    arg!(--"max-tree-len" <N> "Budget in tree nodes")
                        .value_parser(value_parser!(usize))
                        .default_value("200"),
                )
                .arg(
                    arg!(--seed <N> "RNG seed")
                        .value_parser(value_parser!(u64))
                        .required(false),
                )
                .arg(
                    arg!(-f --format <F> "Output format (0: binary, 1: JSON, 2: pretty JSON)")
                        .value_parser(value_parser!(u32))
                        .default_value("0"),
                ),
        );
    cmd.get_matches()
}

fn fuzz(sub_args: &clap::ArgMatches) -> Result<(), Error> {
    let grammar_path = PathBuf::from(sub_args.get_one::<String>("grammar").unwrap());
    let start_symbol = sub_args.get_one::<String>("start-symbol").unwrap();
    let output_dir = PathBuf::from(sub_args.get_one::<String>("output-dir").unwrap());
    let max_tree_len = *sub_args.get_one::<usize>("max-tree-len").unwrap();
    let seed = sub_args
        .get_one::<u64>("seed")
        .copied()
        .unwrap_or_else(current_nanos);
    let arguments: Vec<String> = sub_args
        .get_many::<String>("arguments")
        .unwrap()
        .cloned()
        .collect();

    let ctx = load_grammar(&grammar_path, max_tree_len)?;
    let start = ctx.nt_id(start_symbol).ok_or_else(|| {
        Error::illegal_argument(format!("start symbol <{start_symbol}> is not in the grammar"))
    })?;

    let setting = FuzzerSetting {
        work_dir: output_dir.clone(),
        bitmap_size: *sub_args.get_one::<usize>("map-size").unwrap(),
        number_of_generate_inputs: *sub_args.get_one::<usize>("generate-inputs").unwrap(),
        havoc_iterations: *sub_args.get_one::<usize>("havoc-iterations").unwrap(),
        max_chunks_per_rule: *sub_args.get_one::<usize>("chunks-per-rule").unwrap(),
    };

    std::fs::create_dir_all(&output_dir)?;
    let executor = CommandExecutor::new(
        arguments,
        &output_dir,
        PathBuf::from(sub_args.get_one::<String>("feedback-file").unwrap()),
        None,
        Duration::from_millis(*sub_args.get_one::<u64>("timeout").unwrap()),
        sub_args.get_flag("debug-child"),
    )?;

    println!("fuzzing with seed {seed}");
    let mut fuzzer = GrammarFuzzer::new(
        ctx,
        start,
        setting,
        FuzzState::with_seed(seed),
        executor,
        &STOP,
    )?;
    fuzzer.run_loop()
}

fn vuzzer(sub_args: &clap::ArgMatches) -> Result<(), Error> {
    let in_dir = PathBuf::from(sub_args.get_one::<String>("corpus-dir").unwrap());
    let out_dir = PathBuf::from(sub_args.get_one::<String>("output-dir").unwrap());
    let seed = sub_args
        .get_one::<u64>("seed")
        .copied()
        .unwrap_or_else(current_nanos);
    let arguments: Vec<String> = sub_args
        .get_many::<String>("arguments")
        .unwrap()
        .cloned()
        .collect();

    let setting = VUzzerSetting {
        in_dir,
        out_dir: out_dir.clone(),
        pop_size: *sub_args.get_one::<usize>("pop-size").unwrap(),
        fill_seeds_with_crossover_prob: *sub_args.get_one::<f64>("crossover-prob").unwrap(),
        keep_num: *sub_args.get_one::<usize>("keep-num").unwrap(),
        ehb_interval: *sub_args.get_one::<u64>("ehb-interval").unwrap(),
        ehb_penalty: *sub_args.get_one::<f64>("ehb-penalty").unwrap(),
        path_to_weight_file: sub_args.get_one::<String>("weights").map(PathBuf::from),
        path_to_full_dict: sub_args.get_one::<String>("full-dict").map(PathBuf::from),
        path_to_unique_dict: sub_args.get_one::<String>("unique-dict").map(PathBuf::from),
    };

    std::fs::create_dir_all(&out_dir)?;
    let executor = CommandExecutor::new(
        arguments,
        &out_dir,
        PathBuf::from(sub_args.get_one::<String>("feedback-file").unwrap()),
        Some(PathBuf::from(
            sub_args.get_one::<String>("taint-file").unwrap(),
        )),
        Duration::from_millis(*sub_args.get_one::<u64>("timeout").unwrap()),
        sub_args.get_flag("debug-child"),
    )?;

    println!("evolving with seed {seed}");
    let mut vuzzer = VUzzer::new(
        setting,
        VUzzerState::new(StdRand::with_seed(seed)),
        executor,
        &STOP,
    )?;
    while !vuzzer.stop_requested() {
        vuzzer.one_loop()?;
    }
    Ok(())
}

fn example(sub_args: &clap::ArgMatches) -> Result<(), Error> {
    let grammar_path = PathBuf::from(sub_args.get_one::<String>("grammar").unwrap());
    let start_symbol = sub_args.get_one::<String>("start-symbol").unwrap();
    let n = *sub_args.get_one::<usize>("N").unwrap();
    let max_tree_len = *sub_args.get_one::<usize>("max-tree-len").unwrap();
    let format = *sub_args.get_one::<u32>("format").unwrap();
    let seed = sub_args
        .get_one::<u64>("seed")
        .copied()
        .unwrap_or_else(current_nanos);

    let ctx = load_grammar(&grammar_path, max_tree_len)?;
    let start = ctx.nt_id(start_symbol).ok_or_else(|| {
        Error::illegal_argument(format!("start symbol <{start_symbol}> is not in the grammar"))
    })?;

    let mut state = FuzzState::with_seed(seed);
    let mut out = std::io::stdout();
    for _ in 0..n {
        let budget = ctx.random_len_for_nt(&mut state, start);
        let mut tree = Tree::default();
        tree.generate_from_nt(&mut state, start, budget, &ctx);

        match format {
            0 => {
                out.write_all(&tree.unparse(&ctx))?;
                out.write_all(b"\n")?;
            }
            1 => println!(
                "{}",
                serde_json::to_string(&tree).map_err(|e| Error::serialize(format!("{e}")))?
            ),
            2 => println!(
                "{}",
                serde_json::to_string_pretty(&tree)
                    .map_err(|e| Error::serialize(format!("{e}")))?
            ),
            f => println!("{f}: invalid format"),
        }
    }
    Ok(())
}

fn run() -> Result<(), Error> {
    let args = get_args();
    install_signal_handlers()?;

    if let Some(sub_args) = args.subcommand_matches("fuzz") {
        fuzz(sub_args)
    } else if let Some(sub_args) = args.subcommand_matches("vuzzer") {
        vuzzer(sub_args)
    } else if let Some(sub_args) = args.subcommand_matches("example") {
        example(sub_args)
    } else {
        unreachable!("subcommand is required")
    }
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
