#![allow(dead_code)]

use tokio::{fs, io::AsyncReadExt};

#[derive(Debug, serde::Deserialize)]
pub struct Config {
    pub pingpong: Pingpong,
}

#[derive(Debug, serde::Deserialize)]
pub struct Pingpong {
    pub address: String,
    pub port: u16,
    pub message: String,
}

impl Config {
    pub async fn from_path(path: &str) -> Self {
        let mut file = fs::File::open(path).await.unwrap();
        let mut s = String::new();
        file.read_to_string(&mut s).await.unwrap();

        toml::from_str::<Config>(&s).unwrap()
    }
}
