use std::env::{self, VarError};
use std::fs::File;
use std::io::Write;
use std::path::Path;

const DEFAULT_STATIC_ARRAY_BACKEND_SIZE_BYTES: u32 = 32 * 1024 * 1024;
const SIZE_VAR: &str = "SEGFIT_ALLOC_STATIC_ARRAY_BACKEND_BYTES";

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR environment variable not provided");
    let dest = Path::new(&out_dir).join("segfit_alloc_static_array_backend_size_bytes.txt");

    let size: u32 = match env::var(SIZE_VAR) {
        Ok(s) => s
            .parse()
            .expect("SEGFIT_ALLOC_STATIC_ARRAY_BACKEND_BYTES must be a 32 bit unsigned integer"),
        Err(VarError::NotPresent) => DEFAULT_STATIC_ARRAY_BACKEND_SIZE_BYTES,
        Err(VarError::NotUnicode(_)) => {
            panic!("SEGFIT_ALLOC_STATIC_ARRAY_BACKEND_BYTES must be valid unicode")
        }
    };

    let mut f = File::create(&dest).expect("could not create static arena size file");
    write!(f, "{}", size).expect("could not write static arena size file");

    println!("cargo:rerun-if-env-changed={}", SIZE_VAR);
}
