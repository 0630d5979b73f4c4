use std::fs;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src");

    enforce_log_only_output();
}

fn enforce_log_only_output() {
    // Library output goes through the `log` facade; callers pick the logger.
    let forbidden = ["println!(", "eprintln!(", "print!(", "eprint!(", "dbg!("];

    let mut violations = Vec::new();
    let mut stack = vec![PathBuf::from("src")];
    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            if path.extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let rel = path.to_string_lossy().to_string();
            let src = match fs::read_to_string(&path) {
                Ok(s) => s,
                Err(_) => continue,
            };
            for (line_no, line) in src.lines().enumerate() {
                let code = line.split("//").next().unwrap_or("");
                for token in &forbidden {
                    if code.contains(token) {
                        violations.push(format!(
                            "{}:{} contains forbidden token '{}'",
                            rel,
                            line_no + 1,
                            token
                        ));
                    }
                }
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\nerror: direct console output in library sources; use the log macros instead:");
        for v in violations {
            eprintln!("  - {v}");
        }
        panic!("direct console output in spline-unfold sources");
    }
}
