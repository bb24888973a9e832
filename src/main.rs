use std::process::ExitCode;

fn main() -> ExitCode {
    dotnet_engine::run_cli()
}
