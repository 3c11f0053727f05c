//! Operator tooling for resources on the local host.
//!
//! `reset-workers` purges the kernel's SEM_UNDO bookkeeping along with the
//! counter, which breaks the per-process undo invariant; it exists for
//! recovery after worker crashes have skewed the registration count, not
//! for normal operation.

use std::env;
use std::process::ExitCode;

use semian::Resource;

fn print_usage(program: &str) {
    eprintln!(
        r#"Usage:
  {prog} state <resource>          Show key, id, tickets and workers
  {prog} unregister <resource>     Decrement the registered worker count
  {prog} reset-workers <resource>  Force the worker count to zero
  {prog} destroy <resource>        Remove the semaphore set

Examples:
  # Inspect the bulkhead for the mysql shard
  {prog} state mysql_shard_0

  # Recover from a skewed registration count
  {prog} reset-workers mysql_shard_0
"#,
        prog = program
    );
}

fn show_state(name: &str) -> semian::Result<()> {
    let resource = Resource::attach(name)?;
    println!("resource:           {name}");
    println!("key:                {}", resource.key());
    println!("semid:              {}", resource.id());
    println!("tickets available:  {}", resource.count()?);
    println!("tickets configured: {}", resource.tickets()?);
    println!("registered workers: {}", resource.registered_workers()?);
    Ok(())
}

fn run(command: &str, name: &str) -> semian::Result<()> {
    match command {
        "state" => show_state(name),
        "unregister" => {
            let resource = Resource::attach(name)?;
            resource.unregister_worker()?;
            println!(
                "registered workers for '{name}': {}",
                resource.registered_workers()?
            );
            Ok(())
        }
        "reset-workers" => {
            let resource = Resource::attach(name)?;
            resource.reset_registered_workers()?;
            println!("registered workers for '{name}' reset to 0");
            Ok(())
        }
        "destroy" => {
            let resource = Resource::attach(name)?;
            resource.destroy()?;
            println!("destroyed '{name}'");
            Ok(())
        }
        _ => Err(semian::Error::BadConfig(format!(
            "unknown command '{command}'"
        ))),
    }
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        print_usage(&args[0]);
        return ExitCode::FAILURE;
    }

    match run(args[1].as_str(), args[2].as_str()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}: {err}", args[0]);
            ExitCode::FAILURE
        }
    }
}
