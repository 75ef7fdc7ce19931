pub mod shmem;
