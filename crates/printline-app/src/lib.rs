// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printline command-line entry points shared by the three role binaries:
//
//   printline          coordinator (mesh tools + printer side)
//   printline-worker   worker (scanner + reconstruction side)
//   printline-watch    polls the scanner and launches `printline` per new scan

pub mod cli;
pub mod services;
