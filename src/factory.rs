//! Resolving user-facing target names and wiring up a [`Fuzzer`].

use crate::config::{parse_option, Config};
use crate::device::Device;
use crate::fuzz::Fuzzer;
use crate::host::Host;

use anyhow::Context;

/// Match `pattern` against the (package, executable) catalog.
///
/// `pkg/exe` patterns substring-match each component separately; a bare
/// pattern matches targets whose package *or* executable contains it. An
/// empty pattern matches everything.
pub fn resolve(catalog: &[(String, String)], pattern: &str) -> Vec<(String, String)> {
    let (want_package, want_executable) = match pattern.find('/') {
        Some(i) => (&pattern[..i], &pattern[i + 1..]),
        None => ("", ""),
    };
    catalog
        .iter()
        .filter(|(package, executable)| {
            if pattern.is_empty() {
                true
            } else if pattern.contains('/') {
                package.contains(want_package) && executable.contains(want_executable)
            } else {
                package.contains(pattern) || executable.contains(pattern)
            }
        })
        .cloned()
        .collect()
}

/// Build the Host described by `config`.
pub fn make_host(config: &Config) -> anyhow::Result<Host> {
    let build_dir = config.resolved_build_dir();
    let symbolizer = config
        .symbolizer
        .clone()
        .unwrap_or_else(|| build_dir.join("host_x64").join("symbolize"));
    let mut build_id_dirs = vec![build_dir.join(".build-id")];
    build_id_dirs.extend(config.build_id_dirs.iter().cloned());
    Host::new(
        config.source_dir.clone(),
        build_dir,
        symbolizer,
        config.llvm_symbolizer.clone(),
        build_id_dirs,
    )
    .context("host setup failed")
}

/// Resolve `pattern` to exactly one target and wire a Fuzzer to a fresh
/// Device built from the host-level transport settings.
pub fn make_fuzzer(config: &Config, host: Host, pattern: &str) -> anyhow::Result<Fuzzer> {
    let catalog = host.fuzzers().context("failed to read fuzzer manifest")?;
    let mut matches = resolve(&catalog, pattern);
    if matches.is_empty() {
        anyhow::bail!("no fuzzer matches '{}'", pattern);
    }
    if matches.len() > 1 {
        let names: Vec<String> = matches
            .iter()
            .map(|(p, e)| format!("{}/{}", p, e))
            .collect();
        anyhow::bail!(
            "'{}' is ambiguous; it matches: {}",
            pattern,
            names.join(", ")
        );
    }
    let (package, executable) = matches.remove(0);
    make_fuzzer_for(config, host, package, executable)
}

/// Wire a Fuzzer for an already-resolved (package, executable) pair.
/// Callers that walked the catalog themselves must come through here, not
/// back through pattern matching: an exact name can still be a substring
/// of a sibling target's name.
pub fn make_fuzzer_for(
    config: &Config,
    host: Host,
    package: String,
    executable: String,
) -> anyhow::Result<Fuzzer> {
    let device = Device::new(config.device_addr.clone(), config.ssh.clone());
    let mut fuzzer = Fuzzer::new(device, host, package, executable, config.output.clone());
    fuzzer.set_foreground(config.foreground);
    fuzzer.set_debug(config.debug);
    for option in &config.options {
        // Already validated by Config::check.
        let (key, value) = parse_option(option)?;
        fuzzer.set_option(key, value);
    }
    Ok(fuzzer)
}
