use clap::Parser as ClapParser;
use std::process;

use bond::{
    Code, GcSettings, HeapObject, IsolateSettings, Op, Runtime,
    RuntimeCreateInfo, RuntimeError, Value, wait_until_completed_tagged,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of isolates to spawn
    #[arg(long, default_value_t = 8)]
    isolates: usize,

    /// Live objects before the first collection
    #[arg(long, default_value_t = GcSettings::default().alloc_limit)]
    alloc_limit: usize,

    /// Every n-th isolate divides by zero, 0 disables
    #[arg(long, default_value_t = 0, help = "Make every n-th isolate fail")]
    fail_every: usize,

    /// Log isolate and collector events
    #[arg(short, long)]
    verbose: bool,
}

fn run(cli: &Cli) -> Result<(), RuntimeError> {
    let runtime = Runtime::new(RuntimeCreateInfo {
        gc: GcSettings {
            alloc_limit: cli.alloc_limit,
            ..Default::default()
        },
        isolates: IsolateSettings::default(),
    })?;
    let mut vm = runtime.new_vm();

    // fn(x) { return x * 2 }
    let double = vm.make(HeapObject::Function(Code::new(
        "double",
        1,
        vec![Value::Int(2)],
        vec![Op::Arg(0), Op::Const(0), Op::Mul, Op::Return],
    )));
    vm.push(double);
    // fn(x) { return x / 0 }
    let broken = vm.make(HeapObject::Function(Code::new(
        "broken",
        1,
        vec![Value::Int(0)],
        vec![Op::Arg(0), Op::Const(0), Op::Div, Op::Return],
    )));
    vm.push(broken);

    let mut futures = Vec::with_capacity(cli.isolates);
    for i in 0..cli.isolates {
        let fails = cli.fail_every > 0 && (i + 1) % cli.fail_every == 0;
        let function = if fails { broken } else { double };
        let future = runtime.start_isolate(
            vm.mutator(),
            function,
            vec![Value::Int(i as i64)],
        )?;
        vm.push(Value::Ref(future));
        futures.push(Value::Ref(future));
    }

    let poll = runtime.isolate_settings().poll_interval;
    let results = wait_until_completed_tagged(vm.mutator(), &futures, poll)?;

    let mut errors = 0;
    for tagged in results.iter().filter_map(|value| value.as_gc()) {
        let Some(result) = tagged.as_result() else {
            continue;
        };
        if result.is_error {
            errors += 1;
        }
        println!("{}", Value::Ref(tagged));
    }
    println!(
        "{} isolates, {} succeeded, {errors} failed",
        results.len(),
        results.len() - errors
    );
    println!("{:?}", runtime.gc().stats());
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(level),
    )
    .init();

    if let Err(err) = run(&cli) {
        eprintln!("{err}");
        process::exit(1);
    }
}
