//! OpenAPI Specification Generator Binary
//!
//! Prints the MAL2 OpenAPI specification as JSON to stdout.
//!
//! Usage:
//!   cargo run -p mal2-api --bin generate-openapi --features openapi > openapi.json

use mal2_api::ApiDoc;

fn main() {
    match ApiDoc::to_json() {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Failed to serialize OpenAPI spec: {}", e);
            std::process::exit(1);
        }
    }
}
