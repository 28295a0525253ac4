use cextbridge::cli;

fn main() -> anyhow::Result<()> {
    if let Err(e) = cli::run() {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use cextbridge::cli::{BridgeCli, Command};
    use num_bigint::BigInt;

    #[test]
    fn pack_command_parses_layout() {
        let cli = BridgeCli::parse_from([
            "cextbridge",
            "pack",
            "-1",
            "--words",
            "2",
            "--size",
            "4",
            "--flags",
            "msword,msbyte,2comp",
        ]);
        match cli.command() {
            Command::Pack {
                value,
                words,
                size,
                nails,
                flags,
            } => {
                assert_eq!(*value, BigInt::from(-1));
                assert_eq!((*words, *size, *nails), (2, 4, 0));
                assert_eq!(flags, "msword,msbyte,2comp");
            }
            other => panic!("expected pack command, got {other:?}"),
        }
    }

    #[test]
    fn symbols_command_takes_json_flag() {
        let cli = BridgeCli::parse_from(["cextbridge", "symbols", "--json"]);
        assert!(matches!(cli.command(), Command::Symbols { json: true }));
    }
}
