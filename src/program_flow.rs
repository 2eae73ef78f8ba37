use std::fmt;
use std::str::FromStr;

use clap::ArgMatches;

fn exit_with(msg_prefix: Option<&str>, cause: Option<&dyn fmt::Display>) -> ! {
    match (msg_prefix, cause) {
        (Some(msg), Some(why)) => eprintln!("{}: {}", msg, why),
        (None, Some(why)) => eprintln!("{}", why),
        (Some(msg), None) => eprintln!("{}", msg),
        (None, None) => eprintln!("missing a required value"),
    }
    std::process::exit(1);
}

/// Fatal-exit sugar for the binary: report the failure on stderr and
/// terminate with a nonzero code.
pub trait OrExit<T> {
    fn unwrap_or_exit(self, msg_prefix: Option<&str>) -> T;
}

impl<T, E: fmt::Display> OrExit<T> for Result<T, E> {
    fn unwrap_or_exit(self, msg_prefix: Option<&str>) -> T {
        self.unwrap_or_else(|why| exit_with(msg_prefix, Some(&why)))
    }
}

impl<T> OrExit<T> for Option<T> {
    fn unwrap_or_exit(self, msg_prefix: Option<&str>) -> T {
        self.unwrap_or_else(|| exit_with(msg_prefix, None))
    }
}

pub fn extract_str_arg(matches: &ArgMatches, arg_name: &str) -> String {
    match matches.value_of(arg_name) {
        Some(value) => value.to_string(),
        None => exit_with(Some(&format!("the argument {} is required", arg_name)), None),
    }
}

pub fn extract_optional_str_arg(matches: &ArgMatches, arg_name: &str) -> Option<String> {
    matches.value_of(arg_name).map(|s| s.to_string())
}

pub fn extract_optional_numeric_arg<T>(
    matches: &ArgMatches,
    arg_name: &str,
) -> Result<Option<T>, String>
    where T: FromStr, <T as FromStr>::Err: fmt::Display {
    match matches.value_of(arg_name) {
        None => Ok(None),
        Some(s) => s
            .parse::<T>()
            .map(Some)
            .map_err(|why| format!("failed to parse the argument {}: {}", arg_name, why)),
    }
}
