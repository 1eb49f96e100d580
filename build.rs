//! Build script for ferrodiag
//!
//! Without the `mpi` feature there is no native code. With it, the C shim in
//! `csrc/` is compiled against whichever MPI the build host exposes, found
//! through pkg-config first and the `mpicc` wrapper second.
//!
//! `FERRODIAG_MPI_SOURCE` (and `FERRODIAG_MPI_PKG_VERSION` when pkg-config
//! answered) are passed to the crate so a run can log what it was built
//! against next to what it loaded at runtime.

use std::env;
use std::path::PathBuf;
use std::process::Command;

/// pkg-config names tried when `MPI_PKG_CONFIG` is unset.
const PKG_NAMES: [&str; 2] = ["ompi", "mpich"];

fn main() {
    println!("cargo:rerun-if-changed=csrc/ferrodiag.c");
    println!("cargo:rerun-if-changed=csrc/ferrodiag.h");
    println!("cargo:rerun-if-env-changed=MPI_PKG_CONFIG");
    println!("cargo:rerun-if-env-changed=MPICC");

    if env::var_os("CARGO_FEATURE_MPI").is_none() {
        return;
    }

    let mpi = match discover() {
        Ok(mpi) => mpi,
        Err(tried) => panic!(
            "the `mpi` feature needs an MPI installation; tried {tried}.\n\
             Set MPI_PKG_CONFIG to its pkg-config name or MPICC to its compiler wrapper,\n\
             or build without `--features mpi`"
        ),
    };

    let mut shim = cc::Build::new();
    shim.file("csrc/ferrodiag.c")
        .include("csrc")
        .includes(&mpi.include_paths)
        .warnings(true);
    shim.compile("ferrodiag");

    for dir in &mpi.link_paths {
        println!("cargo:rustc-link-search=native={}", dir.display());
        // Launch nodes may not share the build host's library path.
        println!("cargo:rustc-link-arg=-Wl,-rpath,{}", dir.display());
    }
    for lib in &mpi.libs {
        println!("cargo:rustc-link-lib={lib}");
    }

    println!("cargo:rustc-env=FERRODIAG_MPI_SOURCE={}", mpi.source);
    if let Some(version) = &mpi.pkg_version {
        println!("cargo:rustc-env=FERRODIAG_MPI_PKG_VERSION={version}");
    }
}

/// Compile and link flags for one MPI installation.
struct MpiLink {
    source: String,
    pkg_version: Option<String>,
    include_paths: Vec<PathBuf>,
    link_paths: Vec<PathBuf>,
    libs: Vec<String>,
}

/// Returns the list of what was tried on failure.
fn discover() -> Result<MpiLink, String> {
    let names: Vec<String> = match env::var("MPI_PKG_CONFIG") {
        Ok(name) => vec![name],
        Err(_) => PKG_NAMES.iter().map(ToString::to_string).collect(),
    };
    for name in &names {
        let probed = pkg_config::Config::new().cargo_metadata(false).probe(name);
        if let Ok(lib) = probed {
            return Ok(MpiLink {
                source: format!("pkg-config {name}"),
                pkg_version: Some(lib.version),
                include_paths: lib.include_paths,
                link_paths: lib.link_paths,
                libs: lib.libs,
            });
        }
    }

    let wrapper = env::var("MPICC").unwrap_or_else(|_| "mpicc".into());
    let shown = Command::new(&wrapper)
        .arg("-show")
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| String::from_utf8_lossy(&out.stdout).into_owned());
    match shown {
        Some(line) => Ok(from_wrapper_flags(&wrapper, &line)),
        None => Err(format!("pkg-config {} and `{wrapper} -show`", names.join("/"))),
    }
}

/// Pick `-I`, `-L` and `-l` out of a compiler wrapper's command line.
fn from_wrapper_flags(wrapper: &str, line: &str) -> MpiLink {
    let mut link = MpiLink {
        source: wrapper.to_string(),
        pkg_version: None,
        include_paths: Vec::new(),
        link_paths: Vec::new(),
        libs: Vec::new(),
    };
    for flag in line.split_whitespace() {
        if let Some(dir) = flag.strip_prefix("-I") {
            link.include_paths.push(dir.into());
        } else if let Some(dir) = flag.strip_prefix("-L") {
            link.link_paths.push(dir.into());
        } else if let Some(lib) = flag.strip_prefix("-l") {
            link.libs.push(lib.to_string());
        }
    }
    if link.libs.is_empty() {
        link.libs.push("mpi".into());
    }
    link
}
