//! Parses `-f name[:opt1=val1[,opt2=val2...]]` filter specs from the command
//! line into the concrete [`occystrap_lib::pipeline::Filter`] they name.

use std::collections::HashMap;

use color_eyre::eyre::{Context, Result};
use occystrap_lib::{
    error::UriParseError,
    filter::{Exclude, Inspect, NormalizeTimestamps, Search},
    pipeline::Filter,
    Filters,
};

/// Parses one `-f` argument into a boxed filter, ready to hand to
/// [`occystrap_lib::pipeline::build_chain`].
pub fn parse(spec: &str) -> Result<Box<dyn Filter>> {
    let (name, opts) = match spec.split_once(':') {
        Some((name, opts)) => (name, parse_opts(opts)?),
        None => (spec, HashMap::new()),
    };

    match name {
        "normalize-timestamps" => {
            let ts = opts
                .get("ts")
                .map(|ts| ts.parse::<u64>())
                .transpose()
                .context("parse ts option")?;
            Ok(Box::new(NormalizeTimestamps::new(ts)))
        }
        "exclude" => {
            let pattern = opts
                .get("pattern")
                .ok_or_else(|| UriParseError::new("exclude requires pattern=<glob>[,<glob>...]"))?;
            let patterns = Filters::parse_glob(pattern.split(',')).context("parse exclude patterns")?;
            Ok(Box::new(Exclude::new(patterns)))
        }
        "search" => {
            let pattern = opts
                .get("pattern")
                .ok_or_else(|| UriParseError::new("search requires pattern=<>"))?;
            let regex = opts.get("regex").map(|v| v == "true").unwrap_or(false);
            let patterns = if regex {
                Filters::parse_regex([pattern]).context("parse search regex")?
            } else {
                Filters::parse_glob([pattern]).context("parse search glob")?
            };
            Ok(Box::new(Search::new(patterns)))
        }
        "inspect" => {
            let file = opts
                .get("file")
                .ok_or_else(|| UriParseError::new("inspect requires file=<path>"))?;
            Ok(Box::new(Inspect::new(file, Vec::new())))
        }
        other => Err(UriParseError::new(format!("unrecognized filter: {other}")).into()),
    }
}

fn parse_opts(opts: &str) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for pair in opts.split(',') {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| UriParseError::new(format!("malformed filter option: {pair}")))?;
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_filter_name() {
        parse("normalize-timestamps").expect("parse");
    }

    #[test]
    fn parses_filter_with_single_option() {
        parse("normalize-timestamps:ts=1700000000").expect("parse");
    }

    #[test]
    fn parses_filter_with_multiple_options() {
        parse("search:pattern=etc/**,regex=false").expect("parse");
    }

    #[test]
    fn rejects_exclude_without_pattern() {
        let err = parse("exclude").expect_err("should require pattern");
        assert!(err.to_string().contains("pattern"));
    }

    #[test]
    fn rejects_unknown_filter() {
        let err = parse("bogus").expect_err("should reject");
        assert!(err.to_string().contains("unrecognized filter"));
    }
}
