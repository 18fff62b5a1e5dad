use clap::Parser as ClapParser;
use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
    process,
};

use semitalk::{
    Completion, EvalError, Machine, MemorySettings, bootstrap, file_in, load_image, save_image,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Image to load at startup and to save on exit
    #[arg(long, default_value = "semitalk.img")]
    image: PathBuf,

    /// Build a fresh image from the built-in kernel instead of loading one
    #[arg(long)]
    fresh: bool,

    /// Bytes per semispace
    #[arg(long, help = "Size of each of the two semispaces in bytes")]
    semispace_size: Option<usize>,

    /// Class files to compile into the image, in order
    #[arg(long = "file-in", value_name = "FILE")]
    file_in: Vec<PathBuf>,

    /// Expressions to evaluate; their printString is printed
    #[arg(long = "eval", value_name = "EXPR")]
    eval: Vec<String>,

    /// Save the image on exit
    #[arg(long)]
    save: bool,

    /// Log every executed instruction
    #[arg(long)]
    trace: bool,

    /// Print the bytecode of each --eval expression instead of running it
    #[arg(long, help = "Dump bytecode + literals for --eval expressions")]
    dump_bytecode: bool,
}

fn main() {
    let cli = Cli::parse();
    // traced instructions are logged at info
    let default_filter = if cli.trace { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let mut settings = MemorySettings::default();
    if let Some(size) = cli.semispace_size {
        settings.semispace_size = size;
    }

    let mut machine = match open_machine(&cli, settings) {
        Ok(machine) => machine,
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(1);
        }
    };
    machine.tracing = cli.trace;

    for path in &cli.file_in {
        let source = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                eprintln!("Error reading file '{}': {}", path.display(), err);
                process::exit(1);
            }
        };
        match file_in(&mut machine, &source) {
            Ok(report) => {
                for failure in &report.failures {
                    eprintln!("{}: {}", path.display(), failure);
                }
            }
            Err(err) => {
                eprintln!("Error filing in {}: {}", path.display(), err);
                process::exit(1);
            }
        }
    }

    if cli.dump_bytecode {
        for source in &cli.eval {
            dump_bytecode(&mut machine, source);
        }
        return;
    }

    let mut shut_down = false;
    if cli.eval.is_empty() {
        shut_down = run_repl(&mut machine);
    } else {
        for source in &cli.eval {
            match execute_source(&mut machine, source) {
                Ok(Some(text)) => println!("{text}"),
                Ok(None) => {
                    shut_down = true;
                    break;
                }
                Err(err) => {
                    eprintln!("Error: {err}");
                    process::exit(1);
                }
            }
        }
    }

    if cli.save || shut_down {
        if let Err(err) = save_image(&mut machine, &cli.image) {
            eprintln!("Error saving image {}: {}", cli.image.display(), err);
            process::exit(1);
        }
    }
}

fn open_machine(cli: &Cli, settings: MemorySettings) -> Result<Machine, String> {
    if cli.fresh || !cli.image.exists() {
        if !cli.fresh {
            log::info!("no image at {}, bootstrapping", cli.image.display());
        }
        return bootstrap(settings).map_err(|e| format!("bootstrap failed: {e}"));
    }
    load_image(&cli.image, settings).map_err(|e| format!("cannot load {}: {e}", cli.image.display()))
}

/// Runs lines from the machine's input until end of input, `exit`, or
/// `Smalltalk shutDown`. Answers whether the machine was shut down.
fn run_repl(machine: &mut Machine) -> bool {
    println!("semitalk");
    println!("Type 'exit' to quit.");

    let mut input_buffer = String::new();
    loop {
        print!("> ");
        if let Err(err) = io::stdout().flush() {
            eprintln!("Error flushing stdout: {}", err);
            return false;
        }

        input_buffer.clear();
        match machine.read_line(&mut input_buffer) {
            Ok(0) => return false,
            Ok(_) => {
                let input = input_buffer.trim();
                if input == "exit" {
                    return false;
                }
                if input.is_empty() {
                    continue;
                }
                let input = input.to_string();
                match execute_source(machine, &input) {
                    Ok(Some(text)) => println!("{text}"),
                    Ok(None) => return true,
                    Err(err) => eprintln!("Error: {err}"),
                }
            }
            Err(err) => {
                eprintln!("Error reading input: {}", err);
                return false;
            }
        }
    }
}

/// Evaluates `source` and answers the printString of its value, or None
/// when the code shut the machine down. Fatal errors end the process.
fn execute_source(machine: &mut Machine, source: &str) -> Result<Option<String>, String> {
    let value = match machine.evaluate(source) {
        Ok(Completion::Returned(value)) => value,
        Ok(Completion::ShutDown) => return Ok(None),
        Err(EvalError::Compile(err)) => return Err(err.to_string()),
        Err(EvalError::Fatal(err)) => fatal(machine, &err),
    };
    if let Err(err) = machine.flush_output() {
        eprintln!("Error flushing output: {}", err);
    }
    match machine.print_string(value) {
        Ok(text) => Ok(Some(text)),
        Err(err) => fatal(machine, &err),
    }
}

fn dump_bytecode(machine: &mut Machine, source: &str) {
    let nil = machine.nil();
    let compiled = machine
        .class_of(nil)
        .map_err(EvalError::from)
        .and_then(|class| Ok(machine.compile(&format!("doIt\n{source}"), class, true)?));
    match compiled.and_then(|method| Ok(machine.disassemble(method)?)) {
        Ok(text) => {
            println!("== {source} ==");
            print!("{text}");
        }
        Err(err) => {
            eprintln!("Error compiling {source}: {err}");
            process::exit(1);
        }
    }
}

fn fatal(machine: &Machine, err: &dyn std::fmt::Display) -> ! {
    match machine.location() {
        Some(location) => eprintln!("fatal: {err} (in {location})"),
        None => eprintln!("fatal: {err}"),
    }
    process::exit(1);
}
