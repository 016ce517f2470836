use std::path::Path;

/// Runtime profile for a (language, framework) pair: sandbox image, default
/// port, and build/start commands.
#[derive(Debug, Clone)]
pub struct StackProfile {
    pub stack: &'static str,
    pub image: &'static str,
    pub internal_port: u16,
    pub build_command: &'static str,
    pub start_command: &'static str,
    pub env: &'static [(&'static str, &'static str)],
}

const NODE: StackProfile = StackProfile {
    stack: "node",
    image: "node:20-alpine",
    internal_port: 3000,
    build_command: "npm install",
    start_command: "npm start",
    env: &[("NODE_ENV", "development")],
};

const PYTHON: StackProfile = StackProfile {
    stack: "python",
    image: "python:3.12-slim",
    internal_port: 8000,
    build_command: "pip install -r requirements.txt",
    start_command: "python main.py",
    env: &[("PYTHONUNBUFFERED", "1")],
};

const GO: StackProfile = StackProfile {
    stack: "go",
    image: "golang:1.22-alpine",
    internal_port: 8080,
    build_command: "go build ./...",
    start_command: "go run .",
    env: &[],
};

const RUST: StackProfile = StackProfile {
    stack: "rust",
    image: "rust:1.75-slim",
    internal_port: 8080,
    build_command: "cargo build",
    start_command: "cargo run",
    env: &[],
};

const JAVA: StackProfile = StackProfile {
    stack: "java",
    image: "eclipse-temurin:21-alpine",
    internal_port: 8080,
    build_command: "mvn -q package",
    start_command: "mvn spring-boot:run",
    env: &[],
};

/// Fixed mapping from declared stack to a runtime profile. Unknown stacks
/// land on node, the original system's default for web projects.
pub fn resolve(language: &str, framework: Option<&str>) -> StackProfile {
    let language = language.to_ascii_lowercase();
    let framework = framework.map(str::to_ascii_lowercase).unwrap_or_default();
    match (language.as_str(), framework.as_str()) {
        ("node" | "javascript" | "typescript", _) => NODE,
        (_, "angular" | "react" | "nextjs" | "vue") => NODE,
        ("python", _) | (_, "django" | "fastapi" | "flask") => PYTHON,
        ("go" | "golang", _) => GO,
        ("rust", _) => RUST,
        ("java" | "kotlin", _) | (_, "spring") => JAVA,
        _ => NODE,
    }
}

/// Probes the workspace for a concrete start command, falling back to the
/// profile default.
pub fn detect_start_command(root: &Path, profile: &StackProfile) -> String {
    if root.join("package.json").exists() {
        return "npm start".to_string();
    }
    if root.join("manage.py").exists() {
        return "python manage.py runserver 0.0.0.0:8000".to_string();
    }
    if root.join("main.py").exists() {
        return "python main.py".to_string();
    }
    if root.join("go.mod").exists() {
        return "go run .".to_string();
    }
    if root.join("Cargo.toml").exists() {
        return "cargo run".to_string();
    }
    profile.start_command.to_string()
}
