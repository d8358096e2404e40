use kube::CustomResourceExt;
use operator::crd::OCSInitialization;

use clap::Parser;
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Output directory; the CRD is printed to stdout when omitted
    #[arg(short, long)]
    output: Option<String>,
}
fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let crd = serde_yaml::to_string(&OCSInitialization::crd())?;
    match args.output {
        Some(dir) => {
            // Create directory if it does not exist
            std::fs::create_dir_all(&dir)?;
            std::fs::write(format!("{dir}/ocsinitialization.yaml"), crd)?;
        }
        None => print!("{crd}"),
    }
    Ok(())
}
