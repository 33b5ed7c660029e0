use std::process::ExitCode;

fn main() -> ExitCode {
    cil_vm::run_cli()
}
