use std::{fs, io};

fn main() -> io::Result<()> {
    // create_dir_all is a no-op when the directory already exists.
    fs::create_dir_all("./generated/")?;
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path().unwrap());
    }
    tonic_build::configure()
        .out_dir("./generated/")
        .compile(&["./protos/raft.proto"], &["./protos/"])
}
