use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    asr_corpus::apps::run_build_corpus(std::env::args().skip(1))
}
