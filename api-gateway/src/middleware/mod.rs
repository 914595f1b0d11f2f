// ==============================================================================
// middleware/mod.rs - Gateway Middleware
// ==============================================================================
// Description: Middleware modules for the Varda API gateway
// Author: Matt Barham
// Created: 2025-12-16
// Modified: 2025-12-16
// Version: 1.0.0
// ==============================================================================

pub mod auth;
