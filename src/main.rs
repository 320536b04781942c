use peakq::job::Job;
use peakq::settings::{self};

fn main() {
    let settings = settings::load_config().unwrap();
    let mut job = Job::new(settings).unwrap();

    job.run().unwrap();
    job.writeup();
}
