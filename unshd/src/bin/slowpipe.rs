//! Copies stdin to stdout one byte at a time with a pause after each byte.
//! Handy for watching output trickle through a pipeline.

use std::io::{self, Read, Write};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "slowpipe", version)]
struct Args {
    /// Pause after each byte, in milliseconds.
    #[arg(long, default_value_t = 200)]
    delay_ms: u64,
}

fn copy(delay: Duration) -> io::Result<()> {
    let mut stdin = io::stdin().lock();
    let mut stdout = io::stdout().lock();
    let mut byte = [0u8; 1];
    loop {
        match stdin.read(&mut byte) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        stdout.write_all(&byte)?;
        stdout.flush()?;
        thread::sleep(delay);
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    match copy(Duration::from_millis(args.delay_ms)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("slowpipe: {e}");
            ExitCode::FAILURE
        }
    }
}
