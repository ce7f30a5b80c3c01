/// Set the environment variables `GIT_HASH` AND `CARGO_PKG_VERSION` to include
/// the current git revision. Outside a git checkout the revision is "unknown".
fn git_hash() -> Result<(), Box<(dyn std::error::Error)>> {
    let output = std::process::Command::new("git")
        .args(["rev-parse", "--short=12", "HEAD"])
        .output();
    let git_hash = match output {
        Ok(output) if output.status.success() => String::from_utf8(output.stdout)?.trim().to_string(),
        _ => "unknown".to_string(),
    };
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rustc-env=GIT_HASH={git_hash}");
    let orig_version = env!("CARGO_PKG_VERSION");
    println!("cargo:rustc-env=CARGO_PKG_VERSION={orig_version}+{git_hash}");
    Ok(())
}

fn main() -> Result<(), Box<(dyn std::error::Error)>> {
    git_hash()?;
    Ok(())
}
