use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::{error::ErrorKind, ArgGroup, CommandFactory, Parser, ValueEnum};

use mjc::{
    ast::sample,
    backend::{emit, munch, regalloc},
    intern::Interner,
    middle::{
        cfg::{ast_lowering, eval, pretty_print, serialize, Program},
        ssa,
    },
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
#[command(group(ArgGroup::new("input").required(true)))]
struct Args {
    /// Built-in sample program to compile.
    #[arg(long, value_enum, group = "input")]
    sample: Option<Sample>,

    /// Compile a previously serialized program instead of a sample.
    #[arg(long, value_name = "FILE", group = "input")]
    load_cfg: Option<PathBuf>,

    /// Serialize the program right after lowering and keep going.
    #[arg(long, value_name = "FILE")]
    save_cfg: Option<PathBuf>,

    /// Print the IR after the named stages.
    #[arg(long, value_enum, value_name = "STAGE")]
    dump: Vec<Stage>,

    /// Run only the named optimization passes (default: all of them).
    #[arg(long, value_enum, value_name = "PASS", conflicts_with = "no_optimize")]
    opt: Vec<OptPass>,

    /// Skip the SSA optimization passes.
    #[arg(long)]
    no_optimize: bool,

    /// Run the program in the IR interpreter instead of generating code.
    #[arg(long)]
    interpret: bool,

    /// Register allocation strategy.
    #[arg(long, value_enum, default_value_t = Alloc::LinearScan)]
    alloc: Alloc,

    /// Embed the pre-allocation instruction listing and frame shape as
    /// comments in the generated assembly.
    #[arg(long)]
    emit_comments: bool,

    /// Where the assembly goes; `-` for stdout.
    #[arg(short, long, value_name = "FILE", default_value = "out.s")]
    output: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Sample {
    Factorial,
    SumRec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Stage {
    Cfg,
    Ssa,
    Optimized,
    Destructed,
    X64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OptPass {
    CopyProp,
    Cse,
    Dce,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Alloc {
    LinearScan,
    Stack,
}

impl From<Alloc> for regalloc::Strategy {
    fn from(alloc: Alloc) -> Self {
        match alloc {
            Alloc::LinearScan => regalloc::Strategy::LinearScan,
            Alloc::Stack => regalloc::Strategy::Stack,
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let (mut program, mut interner) = load(&args);

    if let Some(path) = &args.save_cfg {
        let bytes = serialize::encode(&program, &interner);
        if let Err(err) = fs::write(path, bytes) {
            eprintln!("error: could not write `{}`: {err}", path.display());
            return ExitCode::FAILURE;
        }
        log::debug!("serialized program to {}", path.display());
    }

    dump(&args, Stage::Cfg, &program, &interner);

    log::debug!("constructing SSA form");
    ssa::construct_program(&mut program, &mut interner);
    dump(&args, Stage::Ssa, &program, &interner);

    if !args.no_optimize {
        log::debug!("optimizing");
        if args.opt.is_empty() {
            ssa::optimize::optimize_program(&mut program);
        } else {
            optimize_selected(&mut program, &args.opt);
        }
        dump(&args, Stage::Optimized, &program, &interner);
    }

    log::debug!("leaving SSA form");
    ssa::destruct::destruct_program(&mut program, &mut interner);
    dump(&args, Stage::Destructed, &program, &interner);

    if args.interpret {
        for value in eval::run(&program) {
            println!("{value}");
        }
        return ExitCode::SUCCESS;
    }

    log::debug!("selecting instructions");
    let program = munch::munch_program(&program, &mut interner);
    if args.dump.contains(&Stage::X64) {
        println!("==== after X64 ====");
        for function in &program.functions {
            println!("{}", function.dump(&interner));
        }
    }

    let listings: Option<Vec<String>> = args.emit_comments.then(|| {
        program
            .functions
            .iter()
            .map(|f| f.dump(&interner))
            .collect()
    });

    log::debug!("allocating registers ({:?})", args.alloc);
    let program = regalloc::allocate_program(program, args.alloc.into());
    let text = emit::emit_program(&program, &interner, listings.as_deref());

    if args.output == Path::new("-") {
        print!("{text}");
        return ExitCode::SUCCESS;
    }
    if let Err(err) = emit::write_assembly(&args.output, &text) {
        eprintln!("error: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

/// Cycles just the requested passes to their mutual fixed point.
fn optimize_selected(program: &mut Program, passes: &[OptPass]) {
    use ssa::optimize::{common_subexpressions, copy_propagation, dead_code};

    for function in &mut program.functions {
        loop {
            let mut changed = false;
            for pass in passes {
                changed |= match pass {
                    OptPass::CopyProp => copy_propagation(function),
                    OptPass::Cse => common_subexpressions(function),
                    OptPass::Dce => dead_code(function),
                };
            }
            if !changed {
                break;
            }
        }
    }
}

fn load(args: &Args) -> (Program, Interner) {
    if let Some(sample) = args.sample {
        let mut interner = Interner::new();
        let ast = match sample {
            Sample::Factorial => sample::factorial(&mut interner),
            Sample::SumRec => sample::sum_rec(&mut interner),
        };
        let program = ast_lowering::lower_program(&ast, &mut interner);
        return (program, interner);
    }

    // clap guarantees exactly one input source
    let path = args.load_cfg.as_ref().unwrap();
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => Args::command()
            .error(
                ErrorKind::InvalidValue,
                format!("could not read '{}': {err}", path.display()),
            )
            .exit(),
    };
    match serialize::decode(&bytes) {
        Ok(decoded) => decoded,
        Err(err) => Args::command()
            .error(
                ErrorKind::InvalidValue,
                format!("'{}' is not a valid program: {err}", path.display()),
            )
            .exit(),
    }
}

fn dump(args: &Args, stage: Stage, program: &Program, interner: &Interner) {
    if args.dump.contains(&stage) {
        println!("==== after {stage:?} ====");
        println!("{}", pretty_print::print_program(program, interner));
    }
}
