use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, error::ErrorKind};
use console::Style;
use tensorcast::convert_to_f32_safetensors;

#[derive(Parser, Debug)]
#[command(
    name = "tensorcast",
    version,
    about = "Convert a torch checkpoint to a float32 safetensors file"
)]
struct Args {
    /// input checkpoint (.pth / .ckpt)
    input: PathBuf,

    /// output .safetensors file name
    output: PathBuf,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            ) =>
        {
            let _ = err.print();
            return ExitCode::SUCCESS;
        },
        Err(_) => {
            println!(
                "Usage: tensorcast_cli <input.pth> <output.safetensors>"
            );
            return ExitCode::from(1);
        },
    };

    let result = convert_to_f32_safetensors(
        &args.input,
        &args.output,
        |name, shape, dtype| {
            println!("{name} {shape:?} {dtype}");
        },
    );

    match result {
        Ok(summary) => {
            let style = Style::new().bold();
            println!(
                "{}",
                style.apply_to(format!(
                    "Converted {} tensors ({} bytes) to {}",
                    summary.tensors,
                    summary.bytes_written,
                    args.output.display(),
                ))
            );
            ExitCode::SUCCESS
        },
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(1)
        },
    }
}
