use clap::Parser as ClapParser;

use vm::{
    Flags, IntrinsicsTable, Opcode, PopularityCounter, ProcessState, Program,
    Signal,
};

/// Placeholder for the native interpreter entry stub; the bottom frame of
/// every stack "returns" here. Never dereferenced by the core.
const INTERPRETER_ENTRY: usize = 0x1000;

#[derive(ClapParser, Debug)]
#[command(author, version, about = "Boot a program image and churn its heaps")]
struct Cli {
    /// Number of allocate-and-scavenge rounds to run
    #[arg(long, default_value_t = 32)]
    rounds: usize,

    /// Allocations per round
    #[arg(long, default_value_t = 512)]
    allocations: usize,

    /// Emit per-GC timings and size deltas
    #[arg(long)]
    print_heap_statistics: bool,

    /// Emit object histograms and dispatch-table fill rate
    #[arg(long)]
    print_program_statistics: bool,

    /// Check heap consistency around every GC phase
    #[arg(long)]
    validate_heaps: bool,

    /// Finish with a snapshot-reshape GC
    #[arg(long)]
    snapshot: bool,
}

fn main() {
    tracing_subscriber::fmt().init();
    let cli = Cli::parse();

    let flags = Flags {
        print_heap_statistics: cli.print_heap_statistics,
        print_program_statistics: cli.print_program_statistics,
        validate_heaps: cli.validate_heaps,
        ..Flags::default()
    };
    let mut program = Program::new(flags);
    program.initialize();

    // A placeholder entry function plus a small dispatch table, enough to
    // exercise the intrinsics plumbing.
    let entry = program
        .create_function(
            0,
            &[],
            &[Opcode::LoadLocal as u8, Opcode::Return as u8],
        )
        .expect("fresh program heap");
    program.set_entry(entry);

    let getter = program
        .create_function(
            1,
            &[],
            &[Opcode::LoadField as u8, Opcode::Return as u8],
        )
        .expect("fresh program heap");
    program
        .create_dispatch_table(&[(0, entry), (1, getter), (2, entry)])
        .expect("fresh program heap");
    let intrinsics =
        IntrinsicsTable { get_field: 0x2000, ..Default::default() };
    program.setup_dispatch_table_intrinsics(&intrinsics, 0x3000);

    let process =
        program.process_spawn_for_main(Vec::new(), INTERPRETER_ENTRY);

    for round in 0..cli.rounds {
        for _ in 0..cli.allocations {
            // Re-read the stack every time: any scavenge moves it.
            let stack = unsafe { (*process).stack() };
            if program.create_coroutine(stack).is_err() {
                program.collect_new_space();
            }
        }
        program.collect_new_space();
        if round % 8 == 7 {
            program.collect_old_space();
        }
    }

    program.collect_garbage();
    program.setup_dispatch_table_intrinsics(&intrinsics, 0x3000);

    if cli.snapshot {
        let mut popularity = PopularityCounter::new();
        program.snapshot_gc(&mut popularity);
        program.setup_dispatch_table_intrinsics(&intrinsics, 0x3000);
    }

    if cli.print_program_statistics {
        program.print_statistics();
    }

    unsafe { (*process).set_state(ProcessState::WaitingForChildren) };
    let done =
        program.schedule_process_for_deletion(process, Signal::Terminated);
    assert!(done, "main process must drain the program");
    std::process::exit(program.exit_code());
}
