use cairn_block::demo::run_write_through_demo;
use std::process::ExitCode;

fn main() -> ExitCode {
    match run_write_through_demo() {
        Ok(result) => {
            for line in result.output_lines() {
                println!("{line}");
            }
            if result.coherent {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(error) => {
            eprintln!("cache_demo failed: {error}");
            ExitCode::FAILURE
        }
    }
}
