use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=kernels/mul_add.cu");

    // Only compile CUDA kernels when the feature is enabled
    if std::env::var("CARGO_FEATURE_CUDA_KERNELS").is_err() {
        return;
    }

    // Detect GPU architecture (default to sm_89 for Ada Lovelace)
    let arch = std::env::var("CUDA_ARCH").unwrap_or_else(|_| "sm_89".to_string());

    let status = Command::new("nvcc")
        .args([
            "--ptx",
            &format!("-arch={arch}"),
            "-O3",
            "--use_fast_math",
            "-o",
            "kernels/mul_add.ptx",
            "kernels/mul_add.cu",
        ])
        .status();

    match status {
        Ok(s) if s.success() => {
            println!("cargo:warning=Compiled kernels/mul_add.cu -> kernels/mul_add.ptx");
        }
        Ok(s) => {
            panic!(
                "nvcc failed for kernels/mul_add.cu with exit code: {s}. \
                 Ensure CUDA toolkit is installed."
            );
        }
        Err(e) => {
            panic!(
                "Failed to run nvcc for kernels/mul_add.cu: {e}. \
                 Ensure CUDA toolkit is installed and nvcc is in PATH."
            );
        }
    }
}
