use std::process::ExitCode;

use utoipa::OpenApi;

fn main() -> ExitCode {
    let spec = match notify_hub::routes::ApiDoc::openapi().to_pretty_json() {
        Ok(spec) => spec,
        Err(err) => {
            eprintln!("failed to render OpenAPI document: {err}");
            return ExitCode::FAILURE;
        }
    };
    let out = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../specs/notify-hub.json");
    if let Some(parent) = out.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            eprintln!("cannot create {}: {err}", parent.display());
            return ExitCode::FAILURE;
        }
    }
    if let Err(err) = std::fs::write(&out, spec) {
        eprintln!("cannot write {}: {err}", out.display());
        return ExitCode::FAILURE;
    }
    println!("Wrote {}", out.display());
    ExitCode::SUCCESS
}
