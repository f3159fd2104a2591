// SPDX-FileCopyrightText: © 2024 Christopher Woods <Christopher.Woods@bristol.ac.uk>
// SPDX-License-Identifier: MIT

fn main() -> std::io::Result<()> {
    built::write_built_file()
}
