fn main() {
    if let Err(err) = murmur::cli::main() {
        eprintln!("❌ Error: {err}");
        std::process::exit(1);
    }
}
