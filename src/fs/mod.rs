pub use filesystem::DriveFilesystem;

mod attr;
mod filesystem;
